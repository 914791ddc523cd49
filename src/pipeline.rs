//! Pipeline Adapters
//!
//! Glue between the relay core and the outside world: a line-delimited JSON
//! reader feeding the limiter, a replay of messages recovered from the
//! durable queue, and a writer that acknowledges delivered messages by
//! removing them from the queue.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::message::{Message, Topic};
use crate::queue::Persistor;

/// One line of input
#[derive(Debug, Deserialize)]
struct InputRecord {
    topic: Topic,
    #[serde(default)]
    data: serde_json::Value,
}

/// One line of output
#[derive(Debug, Serialize)]
struct OutputRecord<'a> {
    channel: &'static str,
    #[serde(flatten)]
    message: &'a Message,
}

/// Read `{"topic": ..., "data": ...}` lines from `reader` into `tx`
///
/// Each record's `data` becomes the payload and is made durable before it
/// is offered downstream. A line that does not decode is turned into a
/// `log` message carrying the decode error. Messages refused by the queue
/// for lack of space are dropped with an error. Returns the number of
/// messages offered.
pub async fn read_messages<R>(
    reader: R,
    persistor: &Persistor,
    tx: &mpsc::Sender<Message>,
) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut offered = 0;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message = match serde_json::from_str::<InputRecord>(line) {
            Ok(record) => match serde_json::to_vec(&record.data) {
                Ok(bytes) => Message::new(record.topic, bytes),
                Err(e) => Message::failure(Topic::Log, format!("{} in {}", e, line)),
            },
            Err(e) => {
                warn!("Malformed input line: {}", e);
                Message::failure(Topic::Log, format!("{} in {}", e, line))
            }
        };

        let message = match persistor.store(message).await {
            Ok(message) => message,
            Err(e) => {
                error!("Dropping incoming message: {}", e);
                continue;
            }
        };

        if tx.send(message).await.is_err() {
            warn!("Limiter has stopped, no longer reading input");
            break;
        }
        offered += 1;
    }

    debug!("Input closed after {} messages", offered);
    Ok(offered)
}

/// Offer every message recovered from the queue to `tx`
pub async fn feed_recovered(persistor: &Persistor, tx: &mpsc::Sender<Message>) -> usize {
    let mut recovered = persistor.output();
    let mut offered = 0;
    while let Some(message) = recovered.recv().await {
        if tx.send(message).await.is_err() {
            break;
        }
        offered += 1;
    }
    offered
}

/// Write admitted messages to `writer`, one JSON line each
///
/// A message is removed from the queue only after its line has been
/// flushed. Stops at the first write error; messages not yet removed stay
/// queued for the next run.
pub async fn write_messages<W>(
    mut rx: mpsc::Receiver<Message>,
    mut writer: W,
    persistor: Persistor,
) -> std::io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut delivered = 0;
    while let Some(message) = rx.recv().await {
        let record = OutputRecord {
            channel: message.topic.channel(),
            message: &message,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        writer.write_all(&line).await?;
        writer.flush().await?;
        persistor.remove(&message).await;
        delivered += 1;
    }
    Ok(delivered)
}
