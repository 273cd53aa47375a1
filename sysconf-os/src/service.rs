use std::{
    io,
    path::PathBuf,
    process::{Command, Output, Stdio},
};

use crate::OsError;

/// Service control through systemd's `systemctl`.
pub(crate) struct Systemctl {
    program: PathBuf,
    /// Exists only while systemd is the running service manager.
    marker: PathBuf,
}

impl Systemctl {
    pub(crate) fn new(program: impl Into<PathBuf>, marker: impl Into<PathBuf>) -> Self {
        Systemctl {
            program: program.into(),
            marker: marker.into(),
        }
    }

    pub(crate) fn set_enabled(&self, unit: &str, enabled: bool) -> Result<(), OsError> {
        if enabled {
            self.run_checked(unit, &["enable", "--now", unit])
        } else {
            self.run_checked(unit, &["stop", unit])?;
            self.run_checked(unit, &["disable", unit])
        }
    }

    pub(crate) fn is_active(&self, unit: &str) -> Result<bool, OsError> {
        // Non-zero covers inactive, failed and unknown units alike
        let output = self.run(&["is-active", "--quiet", unit])?;
        Ok(output.status.success())
    }

    fn run_checked(&self, unit: &str, args: &[&str]) -> Result<(), OsError> {
        let output = self.run(args)?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_failure(
            unit,
            &format!(
                "{} {} failed ({})",
                self.program.display(),
                args.join(" "),
                output.status
            ),
            stderr.trim(),
        ))
    }

    fn run(&self, args: &[&str]) -> Result<Output, OsError> {
        if !self.marker.exists() {
            return Err(OsError::ServiceManagerUnavailable(format!(
                "systemd is not running ({} does not exist)",
                self.marker.display()
            )));
        }
        tracing::debug!(program = %self.program.display(), ?args, "running service manager");
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => OsError::ServiceManagerUnavailable(format!(
                    "service manager {} not found",
                    self.program.display()
                )),
                _ => OsError::io(format!("running {}", self.program.display()), e),
            })
    }
}

fn classify_failure(unit: &str, what: &str, stderr: &str) -> OsError {
    let lower = stderr.to_lowercase();
    if lower.contains("not found")
        || lower.contains("does not exist")
        || lower.contains("not loaded")
    {
        OsError::UnitNotFound(unit.to_string())
    } else if lower.contains("access denied")
        || lower.contains("interactive authentication required")
        || lower.contains("permission denied")
    {
        OsError::PermissionDenied(format!("{}: {}", what, stderr))
    } else {
        OsError::OsRejected(format!("{}: {}", what, stderr))
    }
}
