use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

const IDLE_SLICE: Duration = Duration::from_millis(1);

/// SIGINT/SIGTERM latch polled by the accept loop.
pub struct ShutdownHooks {
    triggered: Arc<AtomicBool>,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install() -> io::Result<Self> {
        let triggered = Arc::new(AtomicBool::new(false));

        #[cfg(unix)]
        {
            let sig_ids = [SIGINT, SIGTERM]
                .into_iter()
                .map(|signal| flag::register(signal, Arc::clone(&triggered)))
                .collect::<io::Result<Vec<_>>>()?;
            Ok(Self { triggered, sig_ids })
        }

        #[cfg(not(unix))]
        {
            Ok(Self { triggered })
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }

    /// Sleeps up to `idle` but returns as soon as a signal arrives.
    /// Returns whether shutdown was requested.
    pub fn idle_for(&self, idle: Duration) -> bool {
        let started = Instant::now();
        while started.elapsed() < idle {
            if self.is_triggered() {
                return true;
            }
            thread::sleep(IDLE_SLICE);
        }
        self.is_triggered()
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}
