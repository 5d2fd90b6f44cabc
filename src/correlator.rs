//! Command/reply correlation over the current connection.
//!
//! The base protocol has no request IDs: a reply belongs to whatever command
//! was written last. Correctness therefore rests on keeping exactly one
//! command on the wire per connection. The `current` mutex is that
//! exclusivity lock; it is held from the write until the reply (or the
//! disconnect) reaches the caller.
//!
//! Each accepted command registers its own single-use reply slot, tagged
//! with the connection generation it was written on. The read loop fills the
//! slot without ever blocking, and a torn-down connection drains it with
//! [`EslError::ConnectionClosed`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::{
    command::{EslCommand, EslResponse},
    connection::DisconnectReason,
    error::{EslError, EslResult},
};

/// Write half of a live connection
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

type ReplySender = oneshot::Sender<EslResult<EslResponse>>;

struct Session {
    generation: u64,
    writer: BoxedWriter,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    open: bool,
    waiter: Option<ReplySender>,
    abandoned: Option<DisconnectReason>,
}

pub(crate) struct Correlator {
    current: Mutex<Option<Session>>,
    slot: StdMutex<Slot>,
    recycle: Notify,
    orphaned: AtomicU64,
    write_timeout: Duration,
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

impl Correlator {
    pub(crate) fn new(write_timeout: Duration) -> Self {
        Self {
            current: Mutex::new(None),
            slot: StdMutex::new(Slot::default()),
            recycle: Notify::new(),
            orphaned: AtomicU64::new(0),
            write_timeout,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a freshly authenticated connection and return its generation.
    ///
    /// Any previous connection is dropped, which closes its write half.
    pub(crate) async fn publish(&self, writer: BoxedWriter) -> u64 {
        let mut current = self
            .current
            .lock()
            .await;
        let generation = {
            let mut slot = self.slot();
            if let Some(stale) = slot
                .waiter
                .take()
            {
                let _ = stale.send(Err(EslError::ConnectionClosed));
            }
            slot.generation += 1;
            slot.open = true;
            slot.abandoned = None;
            slot.generation
        };
        if let Some(old) = current.replace(Session { generation, writer }) {
            debug!(
                generation = old.generation,
                "Replacing connection still marked current"
            );
        }
        generation
    }

    /// Write `command` and wait for its reply.
    ///
    /// Fails with [`EslError::NotConnected`] when no connection is published
    /// and with [`EslError::ConnectionClosed`] when the connection goes away
    /// first. When `reply_timeout` expires the connection is abandoned, since
    /// its late reply would otherwise be taken for the next command's.
    pub(crate) async fn submit(
        &self,
        command: &EslCommand,
        reply_timeout: Option<Duration>,
    ) -> EslResult<EslResponse> {
        let wire = command.to_wire_format()?;

        let mut current = self
            .current
            .lock()
            .await;
        let session = current
            .as_mut()
            .ok_or(EslError::NotConnected)?;
        let generation = session.generation;
        let reply = self.register(generation)?;

        let written = timeout(
            self.write_timeout,
            session
                .writer
                .write_all(wire.as_bytes()),
        )
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(generation, error = %e, "Command write failed");
                self.abandon(
                    &mut current,
                    generation,
                    DisconnectReason::IoError(e.to_string()),
                );
                return Err(EslError::Io(e));
            }
            Err(_) => {
                warn!(generation, "Command write stalled");
                self.abandon(&mut current, generation, DisconnectReason::WriteTimeout);
                return Err(EslError::Timeout {
                    timeout_ms: millis(self.write_timeout),
                });
            }
        }
        trace!(generation, command = command.name(), "Command written");

        let outcome = match reply_timeout {
            Some(limit) => match timeout(limit, reply).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        generation,
                        command = command.name(),
                        timeout_ms = millis(limit),
                        "No reply in time, recycling connection"
                    );
                    self.abandon(&mut current, generation, DisconnectReason::ReplyTimeout);
                    return Err(EslError::Timeout {
                        timeout_ms: millis(limit),
                    });
                }
            },
            None => reply.await,
        };
        drop(current);

        outcome.unwrap_or(Err(EslError::ConnectionClosed))
    }

    fn register(&self, generation: u64) -> EslResult<oneshot::Receiver<EslResult<EslResponse>>> {
        let mut slot = self.slot();
        if !slot.open || slot.generation != generation {
            return Err(EslError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        slot.waiter = Some(tx);
        Ok(rx)
    }

    /// Give up on `generation`: close its slot, drop its writer and wake the
    /// read loop so the connection is replaced for `reason`.
    fn abandon(&self, current: &mut Option<Session>, generation: u64, reason: DisconnectReason) {
        {
            let mut slot = self.slot();
            if slot.generation == generation {
                slot.open = false;
                slot.waiter = None;
                slot.abandoned = Some(reason);
            }
        }
        if current
            .as_ref()
            .map_or(false, |s| s.generation == generation)
        {
            *current = None;
        }
        self.recycle
            .notify_one();
    }

    /// Hand a reply read on `generation` to its waiter.
    ///
    /// Never blocks; a reply nobody is waiting for is logged and counted.
    pub(crate) fn complete(&self, generation: u64, response: EslResponse) {
        let waiter = {
            let mut slot = self.slot();
            if slot.generation == generation {
                slot.waiter
                    .take()
            } else {
                None
            }
        };

        let orphan = match waiter {
            Some(tx) => tx
                .send(Ok(response))
                .err()
                .and_then(Result::ok),
            None => Some(response),
        };
        if let Some(response) = orphan {
            let total = self
                .orphaned
                .fetch_add(1, Ordering::Relaxed)
                + 1;
            warn!(
                generation,
                reply = response.text(),
                orphaned = total,
                "Dropping reply with no waiting command"
            );
        }
    }

    /// Tear down `generation`: fail its waiter and forget its writer.
    pub(crate) async fn retire(&self, generation: u64) {
        let waiter = {
            let mut slot = self.slot();
            if slot.generation != generation {
                None
            } else {
                slot.open = false;
                slot.waiter
                    .take()
            }
        };
        if let Some(tx) = waiter {
            debug!(generation, "Failing in-flight command");
            let _ = tx.send(Err(EslError::ConnectionClosed));
        }

        let mut current = self
            .current
            .lock()
            .await;
        if current
            .as_ref()
            .map_or(false, |s| s.generation == generation)
        {
            *current = None;
        }
    }

    /// Retire whatever generation is newest.
    pub(crate) async fn retire_current(&self) {
        let generation = self
            .slot()
            .generation;
        self.retire(generation)
            .await;
    }

    /// Resolves once `generation` has been abandoned by a command, with the
    /// reason it was given up on.
    pub(crate) async fn recycled(&self, generation: u64) -> DisconnectReason {
        loop {
            self.recycle
                .notified()
                .await;
            if let Some(reason) = self.abandon_reason(generation) {
                return reason;
            }
        }
    }

    fn abandon_reason(&self, generation: u64) -> Option<DisconnectReason> {
        let slot = self.slot();
        if slot.generation != generation {
            return Some(DisconnectReason::ConnectionClosed);
        }
        if slot.open {
            return None;
        }
        Some(
            slot.abandoned
                .clone()
                .unwrap_or(DisconnectReason::ConnectionClosed),
        )
    }

    pub(crate) fn orphaned_count(&self) -> u64 {
        self.orphaned
            .load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EslMessage, MessageType};
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn api_reply(body: &'static str) -> EslResponse {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "api/response".to_string());
        headers.insert("Content-Length".to_string(), body.len().to_string());
        EslMessage::new(
            MessageType::ApiResponse,
            headers,
            Some(Bytes::from_static(body.as_bytes())),
        )
        .into_response()
        .unwrap()
    }

    fn api(command: &str) -> EslCommand {
        EslCommand::Api {
            command: command.to_string(),
        }
    }

    async fn published() -> (Arc<Correlator>, DuplexStream, u64) {
        let correlator = Arc::new(Correlator::new(Duration::from_secs(1)));
        let (local, remote) = tokio::io::duplex(4096);
        let generation = correlator
            .publish(Box::new(local))
            .await;
        (correlator, remote, generation)
    }

    async fn read_command(remote: &mut DuplexStream) -> String {
        let mut buf = vec![0u8; 1024];
        let n = remote
            .read(&mut buf)
            .await
            .unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_submit_without_connection() {
        let correlator = Correlator::new(Duration::from_secs(1));
        let result = correlator
            .submit(&api("status"), None)
            .await;
        assert!(matches!(result, Err(EslError::NotConnected)));
    }

    #[tokio::test]
    async fn test_reply_reaches_waiter() {
        let (correlator, mut remote, generation) = published().await;

        let task = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .submit(&api("status"), None)
                    .await
            })
        };

        assert_eq!(read_command(&mut remote).await, "api status\r\n\r\n");
        correlator.complete(generation, api_reply("ready"));

        let response = task
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.text(), "ready");
        assert_eq!(correlator.orphaned_count(), 0);
    }

    #[tokio::test]
    async fn test_retire_fails_waiter() {
        let (correlator, mut remote, generation) = published().await;

        let task = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .submit(&api("hostname"), None)
                    .await
            })
        };
        read_command(&mut remote).await;
        correlator
            .retire(generation)
            .await;

        assert!(matches!(
            task.await.unwrap(),
            Err(EslError::ConnectionClosed)
        ));
        assert!(matches!(
            correlator
                .submit(&api("status"), None)
                .await,
            Err(EslError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_unsolicited_reply_is_orphaned() {
        let (correlator, _remote, generation) = published().await;
        correlator.complete(generation, api_reply("late"));
        correlator.complete(generation + 7, api_reply("stale"));
        assert_eq!(correlator.orphaned_count(), 2);
    }

    #[tokio::test]
    async fn test_reply_timeout_recycles_connection() {
        let (correlator, mut remote, generation) = published().await;

        let recycled = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .recycled(generation)
                    .await
            })
        };

        let result = correlator
            .submit(&api("status"), Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(result, Err(EslError::Timeout { timeout_ms: 50 })));
        read_command(&mut remote).await;

        let reason = tokio::time::timeout(Duration::from_secs(1), recycled)
            .await
            .expect("read loop should be woken")
            .unwrap();
        assert_eq!(reason, DisconnectReason::ReplyTimeout);

        // The late reply must not be handed to anyone.
        correlator.complete(generation, api_reply("late"));
        assert_eq!(correlator.orphaned_count(), 1);
        assert!(matches!(
            correlator
                .submit(&api("status"), None)
                .await,
            Err(EslError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_failed_write_recycles_as_io_error() {
        let (correlator, remote, generation) = published().await;
        drop(remote);

        let recycled = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .recycled(generation)
                    .await
            })
        };

        let result = correlator
            .submit(&api("status"), Some(Duration::from_secs(1)))
            .await;
        assert!(matches!(result, Err(EslError::Io(_))));

        let reason = tokio::time::timeout(Duration::from_secs(1), recycled)
            .await
            .expect("read loop should be woken")
            .unwrap();
        assert!(matches!(reason, DisconnectReason::IoError(_)));
    }

    #[tokio::test]
    async fn test_publish_bumps_generation() {
        let (correlator, _remote, first) = published().await;
        let (local, _remote2) = tokio::io::duplex(64);
        let second = correlator
            .publish(Box::new(local))
            .await;
        assert_eq!(second, first + 1);

        // Replies tagged with the old generation are not accepted.
        correlator.complete(first, api_reply("old"));
        assert_eq!(correlator.orphaned_count(), 1);
    }
}
