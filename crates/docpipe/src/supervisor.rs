//! Keeps the consumer loop alive.
//!
//! The supervisor owns the loop's task: it spawns it, restarts it when it
//! returns an error, panics or exits without being asked to, and stops it
//! through the shared shutdown signal.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::watch;

use crate::consumer::stop_signal;
use crate::error::ConsumerError;

/// Cloneable trigger for a supervisor's shutdown signal.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Requests shutdown. Safe to call from any thread, more than once.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

pub struct Supervisor {
    name: String,
    check_interval: Duration,
    restart_delay: Duration,
    shutdown: Arc<watch::Sender<bool>>,
    restarts: AtomicU32,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, check_interval: Duration) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            check_interval,
            restart_delay: Duration::from_secs(1),
            shutdown: Arc::new(tx),
            restarts: AtomicU32::new(0),
        }
    }

    /// Pause before respawning a loop that stopped.
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown),
        }
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Runs loops produced by `spawn_loop` until shutdown is triggered.
    /// Each loop receives the shutdown signal and is expected to return
    /// once it flips.
    pub async fn run<F>(&self, mut spawn_loop: F)
    where
        F: FnMut(watch::Receiver<bool>) -> BoxFuture<'static, Result<(), ConsumerError>>,
    {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.tick().await; // skip immediate first tick

        loop {
            if *shutdown.borrow() {
                break;
            }

            tracing::info!(supervisor = %self.name, "Starting consumer loop");
            let mut handle = tokio::spawn(spawn_loop(self.shutdown.subscribe()));

            let joined = loop {
                tokio::select! {
                    joined = &mut handle => break Some(joined),
                    _ = ticker.tick() => {
                        tracing::debug!(supervisor = %self.name, "Consumer loop healthy");
                    }
                    _ = stop_signal(&mut shutdown) => break None,
                }
            };

            let joined = match joined {
                Some(joined) => joined,
                None => {
                    // Let the loop drain its in-flight work.
                    match handle.await {
                        Ok(Err(e)) => {
                            tracing::warn!(supervisor = %self.name, error = %e, "Consumer loop failed during shutdown")
                        }
                        Err(e) => {
                            tracing::error!(supervisor = %self.name, error = %e, "Consumer loop panicked during shutdown")
                        }
                        Ok(Ok(())) => {}
                    }
                    break;
                }
            };

            if *shutdown.borrow() {
                break;
            }

            match joined {
                Ok(Ok(())) => {
                    tracing::warn!(supervisor = %self.name, "Consumer loop exited unexpectedly")
                }
                Ok(Err(e)) => {
                    tracing::error!(supervisor = %self.name, error = %e, "Consumer loop failed")
                }
                Err(e) => tracing::error!(supervisor = %self.name, error = %e, "Consumer loop panicked"),
            }

            let restarts = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::info!(
                supervisor = %self.name,
                restarts,
                delay_ms = self.restart_delay.as_millis() as u64,
                "Restarting consumer loop"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.restart_delay) => {}
                _ = stop_signal(&mut shutdown) => break,
            }
        }

        tracing::info!(supervisor = %self.name, restarts = self.restarts(), "Supervisor stopped");
    }
}
