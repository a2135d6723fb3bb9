use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Background tasks of one stack, stopped together on shutdown.
pub struct BackgroundRunner {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundRunner {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Spawn a task that is handed the shutdown signal and must exit when it
    /// changes.
    pub fn spawn<F, Fut>(&mut self, f: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let rx = self.shutdown_tx.subscribe();
        self.handles.push(tokio::spawn(f(rx)));
    }

    /// Run `f` repeatedly. The period is re-read before every sleep so that
    /// hot-updated intervals take effect without a restart.
    pub fn spawn_periodic<I, F, Fut>(&mut self, interval: I, f: F)
    where
        I: Fn() -> Duration + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.shutdown_tx.subscribe();
        self.handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval()) => { f().await; }
                    _ = rx.changed() => { break; }
                }
            }
        }));
    }

    /// Signal every task to exit without waiting for them.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
    }
}

impl Default for BackgroundRunner {
    fn default() -> Self {
        Self::new()
    }
}
