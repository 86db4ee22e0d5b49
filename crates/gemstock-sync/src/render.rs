//! Render notifications towards whatever displays the stock.
//!
//! The engine never touches UI state. It calls a [`RenderSink`] after a key
//! changed and when the staleness of the displayed data flips.

use tokio::sync::mpsc;

/// Receives render notifications. Implementations must not block.
pub trait RenderSink: Send + Sync {
    /// The value behind `key` changed and should be redrawn.
    fn render(&self, key: &str);

    /// `true` while the shown data may be out of date (store unreachable,
    /// subscription being re-established); `false` once fresh again.
    fn stale(&self, stale: bool);
}

/// Sink that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpRender;

impl RenderSink for NoOpRender {
    fn render(&self, _key: &str) {}
    fn stale(&self, _stale: bool) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderEvent {
    Render(String),
    Stale(bool),
}

/// Forwards notifications into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelRender {
    tx: mpsc::UnboundedSender<RenderEvent>,
}

impl ChannelRender {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RenderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelRender { tx }, rx)
    }
}

impl RenderSink for ChannelRender {
    fn render(&self, key: &str) {
        // A dropped receiver just means nobody is watching.
        let _ = self.tx.send(RenderEvent::Render(key.to_string()));
    }

    fn stale(&self, stale: bool) {
        let _ = self.tx.send(RenderEvent::Stale(stale));
    }
}
