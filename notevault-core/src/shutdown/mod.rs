//! Graceful shutdown of background tasks
//!
//! The storage manager and auto-save queue register their loops here; a
//! single `shutdown` call signals every loop and waits (bounded) for them.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shutdown signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Graceful,
    Immediate,
}

/// Shutdown state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

/// Coordinates the lifetime of spawned background loops
pub struct ShutdownCoordinator {
    state: Mutex<ShutdownState>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator that waits at most `timeout` for tasks to stop
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            state: Mutex::new(ShutdownState::Running),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            timeout,
        }
    }

    /// Subscribe to shutdown notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    pub fn state(&self) -> ShutdownState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ShutdownState::Shutdown)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    /// Spawn a component loop that stops when shutdown is signalled
    ///
    /// Returns false (and spawns nothing) once shutdown has started.
    pub fn spawn<F>(&self, name: impl Into<String>, component: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutting_down() {
            return false;
        }

        let name = name.into();
        let mut shutdown_rx = self.subscribe();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            debug!(component = %task_name, "Component started");
            tokio::select! {
                _ = component => {
                    debug!(component = %task_name, "Component completed");
                }
                signal = shutdown_rx.recv() => {
                    debug!(component = %task_name, ?signal, "Component received shutdown signal");
                }
            }
        });

        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push((name, handle)),
            Err(poisoned) => poisoned.into_inner().push((name, handle)),
        }
        true
    }

    fn take_tasks(&self) -> Vec<(String, JoinHandle<()>)> {
        match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    fn set_state(&self, next: ShutdownState) -> ShutdownState {
        match self.state.lock() {
            Ok(mut state) => std::mem::replace(&mut *state, next),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), next),
        }
    }

    /// Signal every component and wait up to the timeout for each to finish
    pub async fn shutdown(&self) {
        if self.set_state(ShutdownState::ShuttingDown) != ShutdownState::Running {
            debug!("Shutdown already in progress");
            return;
        }
        info!("Initiating graceful shutdown");

        let _ = self.shutdown_tx.send(ShutdownSignal::Graceful);

        for (name, mut handle) in self.take_tasks() {
            if tokio::time::timeout(self.timeout, &mut handle).await.is_err() {
                warn!(component = %name, "Component did not stop in time, aborting");
                handle.abort();
            }
        }

        self.set_state(ShutdownState::Shutdown);
        info!("Shutdown complete");
    }

    /// Abort every component without waiting
    pub fn shutdown_immediately(&self) {
        self.set_state(ShutdownState::Shutdown);
        let _ = self.shutdown_tx.send(ShutdownSignal::Immediate);
        for (_, handle) in self.take_tasks() {
            handle.abort();
        }
    }
}

impl Drop for ShutdownCoordinator {
    fn drop(&mut self) {
        for (_, handle) in self.take_tasks() {
            handle.abort();
        }
    }
}
