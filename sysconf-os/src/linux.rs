use std::{
    fs, io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use nix::{
    errno::Errno,
    sys::{sysinfo::sysinfo, time::TimeSpec, utsname::uname},
    time::{clock_settime, ClockId},
};
use sysconf_core::model::{ClockState, PlatformState};

use crate::{passwd::PasswdFile, service::Systemctl, OsError, PowerAction, SystemOs};

/// Name of the location marker inside the data directory.
pub const LOCATION_FILENAME: &str = "location_info";

#[derive(Debug, Clone)]
pub struct LinuxOsConfig {
    /// Directory holding the location marker.
    pub data_dir: PathBuf,
    pub passwd_file: PathBuf,
    /// Account whose GECOS field holds the contact.
    pub contact_user: String,
    pub systemctl: PathBuf,
    /// Present while systemd is the running service manager.
    pub systemd_marker: PathBuf,
}

impl LinuxOsConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        LinuxOsConfig {
            data_dir: data_dir.into(),
            passwd_file: PathBuf::from("/etc/passwd"),
            contact_user: "root".to_string(),
            systemctl: PathBuf::from("systemctl"),
            systemd_marker: PathBuf::from("/run/systemd/system"),
        }
    }
}

pub struct LinuxOs {
    location_file: PathBuf,
    passwd: PasswdFile,
    contact_user: String,
    systemctl: Systemctl,
}

impl LinuxOs {
    /// Prepare the data directory and create an empty location marker if
    /// there is none yet.
    pub fn open(config: LinuxOsConfig) -> Result<Self, OsError> {
        fs::create_dir_all(&config.data_dir).map_err(|e| {
            OsError::io(
                format!("creating data directory {}", config.data_dir.display()),
                e,
            )
        })?;
        let location_file = config.data_dir.join(LOCATION_FILENAME);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&location_file)
        {
            Ok(_) => tracing::debug!(path = %location_file.display(), "created location marker"),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(OsError::io(
                    format!("creating {}", location_file.display()),
                    e,
                ))
            }
        }
        Ok(LinuxOs {
            location_file,
            passwd: PasswdFile::new(config.passwd_file),
            contact_user: config.contact_user,
            systemctl: Systemctl::new(config.systemctl, config.systemd_marker),
        })
    }

    pub fn location_file(&self) -> &Path {
        &self.location_file
    }
}

fn errno_error(what: &str, errno: Errno) -> OsError {
    match errno {
        Errno::EPERM | Errno::EACCES => OsError::PermissionDenied(format!("{}: {}", what, errno)),
        _ => OsError::OsRejected(format!("{}: {}", what, errno)),
    }
}

impl SystemOs for LinuxOs {
    fn hostname(&self) -> Result<String, OsError> {
        let name = nix::unistd::gethostname().map_err(|e| errno_error("gethostname", e))?;
        Ok(name.to_string_lossy().into_owned())
    }

    fn set_hostname(&self, name: &str) -> Result<(), OsError> {
        nix::unistd::sethostname(name).map_err(|e| match e {
            Errno::EINVAL => OsError::InvalidName(name.to_string()),
            e => errno_error("sethostname", e),
        })
    }

    fn identity_field(&self) -> Result<String, OsError> {
        self.passwd.gecos(&self.contact_user)
    }

    fn set_identity_field(&self, text: &str) -> Result<(), OsError> {
        self.passwd.set_gecos(&self.contact_user, text)
    }

    fn location_marker(&self) -> Result<String, OsError> {
        match fs::read_to_string(&self.location_file) {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(OsError::NotFound(
                self.location_file.display().to_string(),
            )),
            Err(e) => Err(OsError::io(
                format!("reading {}", self.location_file.display()),
                e,
            )),
        }
    }

    fn set_location_marker(&self, text: &str) -> Result<(), OsError> {
        fs::write(&self.location_file, text).map_err(|e| {
            OsError::io(format!("writing {}", self.location_file.display()), e)
        })
    }

    fn service_active(&self, unit: &str) -> Result<bool, OsError> {
        self.systemctl.is_active(unit)
    }

    fn set_service_enabled(&self, unit: &str, enabled: bool) -> Result<(), OsError> {
        self.systemctl.set_enabled(unit, enabled)
    }

    fn platform(&self) -> Result<PlatformState, OsError> {
        let uts = uname().map_err(|e| errno_error("uname", e))?;
        Ok(PlatformState {
            os_name: uts.sysname().to_string_lossy().into_owned(),
            os_release: uts.release().to_string_lossy().into_owned(),
            os_version: uts.version().to_string_lossy().into_owned(),
            machine: uts.machine().to_string_lossy().into_owned(),
        })
    }

    fn clock(&self) -> Result<ClockState, OsError> {
        let now = Utc::now();
        let uptime = sysinfo().map_err(|e| errno_error("sysinfo", e))?.uptime();
        let uptime = chrono::Duration::from_std(uptime)
            .map_err(|e| OsError::OsRejected(format!("uptime out of range: {}", e)))?;
        Ok(ClockState {
            current_datetime: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            boot_datetime: (now - uptime).to_rfc3339_opts(SecondsFormat::Secs, true),
        })
    }

    fn set_current_datetime(&self, datetime: DateTime<FixedOffset>) -> Result<(), OsError> {
        let spec = TimeSpec::new(
            datetime.timestamp() as _,
            datetime.timestamp_subsec_nanos() as _,
        );
        clock_settime(ClockId::CLOCK_REALTIME, spec).map_err(|e| errno_error("clock_settime", e))
    }

    fn power(&self, action: PowerAction) -> Result<(), OsError> {
        nix::unistd::sync();
        let flag = match action {
            PowerAction::Restart => "-r",
            PowerAction::Shutdown => "-P",
        };
        let status = Command::new("shutdown")
            .args([flag, "now"])
            .stdin(Stdio::null())
            .status()
            .map_err(|e| OsError::io("running shutdown", e))?;
        if status.success() {
            Ok(())
        } else {
            Err(OsError::OsRejected(format!(
                "shutdown {} now failed ({})",
                flag, status
            )))
        }
    }
}
