// heartbeat.rs

use std::{
    sync::atomic::AtomicBool,
    thread,
    time::Instant,
};

use crate::*;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1500);
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(10);

const _: () = assert!(HEARTBEAT_INTERVAL.as_millis() < WATCHDOG_TIMEOUT.as_millis());

pub trait Watchdog {
    fn feed(&mut self) -> anyhow::Result<()>;
}

/// Feed the watchdog forever. If this task stops being polled, the device resets.
pub async fn heartbeat<W: Watchdog>(mut wdt: W) -> anyhow::Result<()> {
    loop {
        if let Err(e) = wdt.feed() {
            error!("Watchdog feed failed: {e:#}");
        }
        sleep(HEARTBEAT_INTERVAL).await;
    }
}

/// Watchdog for host builds: a monitor thread that aborts the process when the
/// runtime thread has not fed it within the timeout.
pub struct SoftWatchdog {
    fed_at: Arc<std::sync::Mutex<Instant>>,
    _stop: StopOnDrop,
}

struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl SoftWatchdog {
    pub fn start(timeout: Duration) -> anyhow::Result<Self> {
        let fed_at = Arc::new(std::sync::Mutex::new(Instant::now()));
        let stop = Arc::new(AtomicBool::new(false));

        let (fed, stopped) = (fed_at.clone(), stop.clone());
        thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || {
                loop {
                    thread::sleep(timeout / 10);
                    if stopped.load(Ordering::Relaxed) {
                        break;
                    }
                    let since = match fed.lock() {
                        Ok(t) => t.elapsed(),
                        Err(_) => timeout,
                    };
                    if since >= timeout {
                        error!("Watchdog starved for {since:?}, aborting.");
                        std::process::abort();
                    }
                }
            })?;

        Ok(Self {
            fed_at,
            _stop: StopOnDrop(stop),
        })
    }
}

impl Watchdog for SoftWatchdog {
    fn feed(&mut self) -> anyhow::Result<()> {
        match self.fed_at.lock() {
            Ok(mut t) => {
                *t = Instant::now();
                Ok(())
            }
            Err(_) => bail!("watchdog lock poisoned"),
        }
    }
}


// EOF
