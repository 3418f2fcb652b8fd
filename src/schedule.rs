use parking_lot::Mutex;
use std::{future::Future, time::Duration};
use tokio::{sync::watch, task::JoinHandle, time};
use tracing::{debug, Instrument};

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// A named background ticker with explicit start/stop, so periodic work never
/// outlives the jobs it serves.
pub struct Periodic {
    name: &'static str,
    running: Mutex<Option<Running>>,
}

impl Periodic {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
        }
    }

    /// Starts the loop unless it is already ticking. Returns `true` when a new
    /// loop was spawned.
    pub fn start<F, Fut>(&self, every: Duration, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }
        let (stop, mut stop_rx) = watch::channel(false);
        let name = self.name;
        let handle = tokio::spawn(
            async move {
                let mut ticker = time::interval(every);
                ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => tick().await,
                        _ = stop_rx.changed() => break,
                    }
                }
                debug!(event = "periodic_stopped", name);
            }
            .in_current_span(),
        );
        debug!(event = "periodic_started", name = self.name);
        *running = Some(Running { stop, handle });
        true
    }

    pub fn stop(&self) -> bool {
        match self.running.lock().take() {
            Some(running) => {
                let _ = running.stop.send(true);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[tokio::test]
    async fn start_is_idempotent_and_stop_ends_loop() {
        let periodic = Periodic::new("test");
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        assert!(periodic.start(Duration::from_millis(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
        assert!(!periodic.start(Duration::from_millis(5), || async {}));
        time::sleep(Duration::from_millis(40)).await;
        assert!(ticks.load(Ordering::SeqCst) > 0);

        assert!(periodic.stop());
        assert!(!periodic.is_running());
        let settled = ticks.load(Ordering::SeqCst);
        time::sleep(Duration::from_millis(30)).await;
        assert!(ticks.load(Ordering::SeqCst) <= settled + 1);
        assert!(!periodic.stop());
    }
}
