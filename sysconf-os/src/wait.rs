use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Monitor a wait which may take a long time, such as acquiring a lock held
/// by another process, and log as needed.
/// After SILENT_INTERVAL: log the activity
/// After LOG_INTERVAL: log the activity and duration
pub(crate) struct WaitMonitor {
    done: Arc<AtomicBool>,
}
impl WaitMonitor {
    const SILENT_INTERVAL: Duration = Duration::from_millis(500);
    const LOG_INTERVAL: Duration = Duration::from_secs(5);

    pub(crate) fn new(activity: String) -> WaitMonitor {
        let done = Arc::new(AtomicBool::new(false));
        let r = WaitMonitor { done: done.clone() };
        std::thread::spawn(move || {
            WaitMonitor::run(done, activity);
        });
        r
    }
    fn run(done: Arc<AtomicBool>, activity: String) {
        let start = Instant::now();
        let mut next_log = start + Self::SILENT_INTERVAL;
        loop {
            if done.load(Ordering::Relaxed) {
                break;
            }
            std::thread::sleep(next_log.saturating_duration_since(Instant::now()));
            if done.load(Ordering::Relaxed) {
                break;
            }
            let waited = next_log.duration_since(start);
            if waited <= Self::SILENT_INTERVAL {
                tracing::info!("{}", activity);
            } else {
                tracing::info!("{} ({} s)", activity, waited.as_secs());
            }
            next_log += Self::LOG_INTERVAL;
        }
    }
    pub(crate) fn done(&self) {
        self.done.store(true, Ordering::Relaxed);
    }
}
impl Drop for WaitMonitor {
    fn drop(&mut self) {
        self.done()
    }
}
