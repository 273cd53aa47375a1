mod headless;

use anyhow::Result;

pub(crate) struct Options {
    pub verbose: bool,
    pub color: bool,
}

/// Install the process-wide subscriber. Logs go to stderr, because stdout
/// carries the store session.
pub(crate) fn set_up(options: &Options) -> Result<()> {
    headless::set_up(options)
}
