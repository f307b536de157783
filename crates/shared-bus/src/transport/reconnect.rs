//! Connection supervision for the push transports.
//!
//! A session is one connected subscription. When it ends or fails the
//! supervisor waits the reconnect delay and starts a new one, until the
//! transport's shutdown signal fires. Shutdown interrupts both a running
//! session and the wait between sessions.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::TransportKind;

/// One-shot shutdown signal shared by a transport's background tasks.
#[derive(Debug)]
pub(crate) struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub(crate) fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once shutdown is signalled or the signal's owner is gone.
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `delay`. Returns `false` if shutdown fired first.
pub(crate) async fn sleep_or_shutdown(delay: Duration, rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        () = wait_for_shutdown(rx) => false,
    }
}

/// Run sessions back to back until shutdown.
///
/// `session` receives the attempt number, starting at 0. A session that
/// returns, with or without an error, is followed by `delay` and a new
/// attempt.
pub(crate) async fn supervise<F, Fut>(
    kind: TransportKind,
    delay: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut session: F,
) where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    let mut attempt: u64 = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }

        let outcome = tokio::select! {
            outcome = session(attempt) => outcome,
            () = wait_for_shutdown(&mut shutdown) => break,
        };

        match outcome {
            Ok(()) => warn!(transport = %kind, "Subscription ended, reconnecting in {:?}", delay),
            Err(e) => warn!(
                transport = %kind,
                error = %e,
                "Subscription failed, reconnecting in {:?}",
                delay
            ),
        }

        if !sleep_or_shutdown(delay, &mut shutdown).await {
            break;
        }
        attempt += 1;
        info!(transport = %kind, attempt, "Reconnecting subscription");
    }
    debug!(transport = %kind, "Subscription supervisor stopped");
}
