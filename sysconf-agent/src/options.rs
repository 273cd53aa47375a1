use std::{io::IsTerminal as _, path::PathBuf};

use clap::{ColorChoice, Parser};

#[derive(Parser, Debug, Clone)]
pub struct Options {
    /// Directory for the agent's own state, such as the location marker
    #[arg(long, env = "SYSCONF_DATA_DIR", default_value = "/var/lib/sysconf")]
    pub data_dir: PathBuf,

    /// The passwd file holding the contact
    #[arg(long, default_value = "/etc/passwd")]
    pub passwd_file: PathBuf,

    /// Account whose comment (GECOS) field holds the contact
    #[arg(long, default_value = "root")]
    pub contact_user: String,

    /// NTP service unit; repeat to give fallbacks, tried in order
    #[arg(long = "ntp-unit", value_name = "UNIT", default_values = ["ntpd", "ntp"])]
    pub ntp_units: Vec<String>,

    /// Set this hostname when the hostname is deleted from the configuration.
    /// Without it, the current hostname is kept.
    #[arg(long, value_name = "NAME")]
    pub hostname_on_delete: Option<String>,

    /// The systemctl program used for service control
    #[arg(long, default_value = "systemctl")]
    pub systemctl: PathBuf,

    /// Attempts per leaf when applying fails with an I/O error
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub apply_attempts: u32,

    #[arg(long, value_name = "MS", default_value_t = 0)]
    pub apply_retry_delay_ms: u64,

    #[arg(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    #[arg(long, global = true, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,
}

impl Options {
    /// Whether log output on stderr should use ANSI colors.
    pub fn use_color(&self) -> bool {
        match self.color {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => std::io::stderr().is_terminal(),
        }
    }
}
