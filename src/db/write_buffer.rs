//! Batched writer between sessions and the queue table
//!
//! A session must never wait on SQLite, so discoveries go into an unbounded
//! channel and one background task turns them into multi-row transactions.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::{Database, DownloadQueue, QueueEntry, QueueError};

const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_millis(250);

/// Cloneable, non-blocking handle to the writer task
#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<QueueEntry>,
}

impl DownloadQueue for QueueSender {
    fn push(&self, entry: QueueEntry) -> Result<(), QueueError> {
        self.tx.send(entry).map_err(|_| QueueError::Closed)
    }
}

/// Spawn the writer task.
///
/// The task exits once every [`QueueSender`] is gone and whatever was still
/// pending has been written.
pub fn start_write_buffer(db: Arc<Database>) -> (QueueSender, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run_writer(db, rx));
    (QueueSender { tx }, handle)
}

async fn run_writer(db: Arc<Database>, mut rx: mpsc::UnboundedReceiver<QueueEntry>) {
    let mut pending: Vec<QueueEntry> = Vec::with_capacity(BATCH_SIZE);
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        channel = db.channel(),
        batch_size = BATCH_SIZE,
        flush_interval_ms = FLUSH_INTERVAL.as_millis() as u64,
        "Queue writer running"
    );

    loop {
        let full = tokio::select! {
            received = rx.recv() => match received {
                Some(entry) => {
                    pending.push(entry);
                    pending.len() >= BATCH_SIZE
                }
                None => break,
            },
            _ = ticker.tick() => true,
        };
        if full && !pending.is_empty() {
            write_pending(&db, &mut pending).await;
        }
    }

    if !pending.is_empty() {
        write_pending(&db, &mut pending).await;
    }
    info!("Queue writer stopped: all senders dropped");
}

async fn write_pending(db: &Database, pending: &mut Vec<QueueEntry>) {
    let batch = std::mem::take(pending);
    match db.batch_insert_entries(&batch).await {
        Ok(()) => debug!(rows = batch.len(), "Queue rows written"),
        // The commands themselves are already in the log; only the rows are lost
        Err(e) => error!(rows = batch.len(), error = %e, "Dropping queue rows after write failure"),
    }
}
