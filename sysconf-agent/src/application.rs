use std::{future::Future, process::exit, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use sysconf_os::{LinuxOs, LinuxOsConfig};

use crate::{
    engine::{Engine, RetryPolicy},
    handlers::{HandlerConfig, Handlers, HostnameOnDelete},
    interrupt::InterruptState,
    options::Options,
    supervisor::Supervisor,
};

/// Create the single-threaded tokio runtime used by the agent. OS calls run
/// on its blocking pool.
///
/// Panics if the runtime cannot be created.
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to initialize tokio runtime")
}

/// Handle a Result, printing the error and exiting with code 1 on failure.
pub fn handle_result(r: Result<()>) {
    match r {
        Ok(()) => {}
        Err(e) => {
            eprintln!("sysconf-agent error: {:?}", e);
            exit(1);
        }
    }
}

pub fn block_on<F: Future<Output = Result<()>>>(future: F) -> Result<()> {
    let runtime = runtime();
    let r = runtime.block_on(future);
    // A stdin read may still be pending on the blocking pool
    runtime.shutdown_background();
    r
}

fn linux_os_config(options: &Options) -> LinuxOsConfig {
    LinuxOsConfig {
        passwd_file: options.passwd_file.clone(),
        contact_user: options.contact_user.clone(),
        systemctl: options.systemctl.clone(),
        ..LinuxOsConfig::new(&options.data_dir)
    }
}

fn handler_config(options: &Options) -> HandlerConfig {
    HandlerConfig {
        hostname_on_delete: match &options.hostname_on_delete {
            Some(name) => HostnameOnDelete::Reset(name.clone()),
            None => HostnameOnDelete::Keep,
        },
        ntp_units: options.ntp_units.clone(),
    }
}

fn retry_policy(options: &Options) -> RetryPolicy {
    RetryPolicy {
        attempts: options.apply_attempts,
        delay: Duration::from_millis(options.apply_retry_delay_ms),
    }
}

/// Serve the store session on stdin and stdout until shutdown.
pub async fn run(options: &Options, interrupt_state: InterruptState) -> Result<()> {
    let os = LinuxOs::open(linux_os_config(options)).with_context(|| {
        format!(
            "preparing data directory {}",
            options.data_dir.display()
        )
    })?;
    tracing::info!(location_file = %os.location_file().display(), "OS adapter ready");

    let handlers = Arc::new(Handlers::new(Arc::new(os), handler_config(options)));
    let engine = Engine::new(handlers.clone(), retry_policy(options));
    Supervisor::new(handlers, engine, interrupt_state)
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await
}

/// Combine a primary result with a cleanup result, preserving both errors if both fail.
pub(crate) fn and_cleanup<T>(primary: Result<T>, cleanup: Result<()>) -> Result<T> {
    match (primary, cleanup) {
        (Ok(r), Ok(())) => Ok(r),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e1), Err(e2)) => Err(e1.context(format!("Additionally, cleanup failed: {}", e2))),
    }
}
