//! One-shot stop broadcast shared by an adapter and its threads.
//!
//! Built on a `tokio::sync::watch` channel holding a single flag. A watch
//! channel keeps its latest value, so a listener that subscribes after
//! `stop()` still sees the signal and nobody waits for a stop that already
//! happened.

use std::sync::Arc;
use tokio::sync::watch;

/// Sending side of the stop broadcast.
///
/// Clones share the same signal. `stop()` is idempotent and may be called
/// from any thread, inside or outside a runtime.
///
/// # Example
///
/// ```
/// use scopes_middleware::stop::StopSignal;
///
/// let signal = StopSignal::new();
/// let listener = signal.subscribe();
/// assert!(!listener.is_stopped());
///
/// signal.stop();
/// signal.stop();
/// assert!(listener.is_stopped());
/// assert!(signal.subscribe().is_stopped());
/// ```
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// Create a signal that has not fired.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Broadcast the stop. Returns true only for the call that fired it.
    pub fn stop(&self) -> bool {
        !self.tx.send_replace(true)
    }

    /// Whether `stop()` has been called.
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Create a listener for this signal.
    pub fn subscribe(&self) -> StopListener {
        StopListener {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving side of the stop broadcast.
#[derive(Debug, Clone)]
pub struct StopListener {
    rx: watch::Receiver<bool>,
}

impl StopListener {
    /// Whether the signal has fired, without waiting.
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal has fired.
    ///
    /// Also resolves if every `StopSignal` handle has been dropped, since no
    /// stop can arrive after that.
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}
