//! Broadcast shutdown signal built on a watch channel.
//!
//! Receivers observe the signal through [`tokio::sync::watch::Receiver::changed`], which makes it
//! usable as a branch of `tokio::select!` in every worker loop.

use tokio::sync::watch;

/// Sending half of the shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<()>);

impl ShutdownTx {
    /// Signals shutdown to every subscribed receiver.
    ///
    /// Fails only when no receiver is alive, which callers generally ignore.
    pub fn shutdown(&self) -> Result<(), watch::error::SendError<()>> {
        self.0.send(())
    }

    /// Creates a new receiver that observes only signals sent after this call.
    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

/// Receiving half of the shutdown channel.
pub type ShutdownRx = watch::Receiver<()>;

/// Creates a shutdown channel whose receivers see no signal until [`ShutdownTx::shutdown`] runs.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(());
    (ShutdownTx(tx), rx)
}
