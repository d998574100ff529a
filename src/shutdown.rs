//! Cooperative shutdown.
//!
//! A [`ShutdownTrigger`] / [`Shutdown`] pair wraps a `watch` channel. Jobs
//! hold a [`Shutdown`] and call [`Shutdown::checkpoint`] between the steps
//! of a cycle; long waits race against [`Shutdown::requested`].
//! [`wait_for_signal`] resolves on SIGINT, SIGTERM or SIGABRT.

use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Sending half, owned by the orchestrator.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving half, cloned into every job.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
    /// Keeps the sender of a [`Shutdown::never`] token alive.
    _anchor: Option<Arc<watch::Sender<bool>>>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (
        ShutdownTrigger { tx },
        Shutdown { rx, _anchor: None },
    )
}

impl ShutdownTrigger {
    pub fn request(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
            _anchor: None,
        }
    }
}

impl Shutdown {
    /// A token that never fires, for one-shot runs outside the orchestrator.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _anchor: Some(Arc::new(tx)),
        }
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// `Err(Cancelled)` once shutdown has been requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_requested() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when shutdown is requested or the trigger is dropped.
    pub async fn requested(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|v| *v).await;
    }
}

/// Wait for SIGINT, SIGTERM or SIGABRT and return the signal name.
#[cfg(unix)]
pub async fn wait_for_signal() -> anyhow::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut abort = signal(SignalKind::from_raw(libc::SIGABRT))?;

    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = abort.recv() => "SIGABRT",
    };
    Ok(name)
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> anyhow::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
