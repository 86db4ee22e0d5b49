//! # Debounced Persistence Writer
//!
//! Coalesces cache mutations into one flush per debounce window.
//!
//! ```text
//!  put  put    put                         put
//!   │    │      │                           │
//!   ▼    ▼      ▼                           ▼
//!   ├────────────────────┤ flush            ├────────────────────┤ flush
//!   0                    1s                 t                    t+1s
//! ```
//!
//! The window opens on the first mutation and is not extended by later
//! ones, so a steady stream of writes still reaches the persistent tier
//! once per window.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::cache::{CacheInner, CacheManager, FlushReport};
use crate::persist::PersistentTier;

#[derive(Debug)]
enum WriterCommand {
    /// A key became dirty; open a window if none is open.
    ScheduleFlush,
    /// Flush immediately, cancelling the open window.
    FlushNow(oneshot::Sender<FlushReport>),
    /// Stop without flushing; the owner runs the final flush.
    Shutdown(oneshot::Sender<()>),
}

/// Handle for controlling the writer task.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    cmd_tx: mpsc::Sender<WriterCommand>,
}

impl WriterHandle {
    /// Never blocks. A full queue already holds a pending schedule.
    pub fn schedule_flush(&self) {
        let _ = self.cmd_tx.try_send(WriterCommand::ScheduleFlush);
    }

    /// Flushes now and waits for the result.
    pub async fn flush_now(&self) -> Option<FlushReport> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(WriterCommand::FlushNow(tx)).await.ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(WriterCommand::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

pub(crate) struct DebouncedWriter<P> {
    cache: Weak<CacheInner<P>>,
    debounce: Duration,
}

impl<P: PersistentTier> DebouncedWriter<P> {
    /// Spawns the writer task. It ends when the cache is dropped or on
    /// shutdown.
    pub(crate) fn spawn(cache: Weak<CacheInner<P>>, debounce: Duration) -> WriterHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let writer = DebouncedWriter { cache, debounce };
        tokio::spawn(writer.run(cmd_rx));
        WriterHandle { cmd_tx }
    }

    async fn run(self, mut cmd_rx: mpsc::Receiver<WriterCommand>) {
        debug!(debounce_ms = self.debounce.as_millis() as u64, "Debounced writer started");
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(WriterCommand::ScheduleFlush) => {
                        if deadline.is_none() {
                            deadline = Some(Instant::now() + self.debounce);
                        }
                    }
                    Some(WriterCommand::FlushNow(reply)) => {
                        deadline = None;
                        let _ = reply.send(self.flush().await);
                    }
                    Some(WriterCommand::Shutdown(reply)) => {
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                },
                _ = wait_for(deadline) => {
                    deadline = None;
                    self.flush().await;
                }
            }
        }

        info!("Debounced writer stopped");
    }

    async fn flush(&self) -> FlushReport {
        match self.cache.upgrade() {
            Some(inner) => CacheManager::from_inner(inner).flush_dirty().await,
            None => FlushReport::default(),
        }
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
