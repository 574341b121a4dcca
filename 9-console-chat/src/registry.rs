use std::{collections::HashMap, sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::{io::AsyncWrite, sync::Mutex, time::timeout};
use tracing::{debug, warn};

use crate::protocol::LineWriter;

/// Outbound half of a connection, shared between its session and broadcasts.
pub type SharedWriter<W> = Arc<Mutex<LineWriter<W>>>;

pub fn shared_writer<W>(writer: LineWriter<W>) -> SharedWriter<W> {
    Arc::new(Mutex::new(writer))
}

/// Username to outbound channel mapping.
///
/// Broadcasts work on a snapshot of the map, so the map lock is never held
/// while a recipient is being written to. Delivery is eventual rather than
/// linearizable: a user registering mid-broadcast may or may not see it.
pub struct UserRegistry<W> {
    users: Mutex<HashMap<String, SharedWriter<W>>>,
    write_timeout: Duration,
}

impl<W> UserRegistry<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            write_timeout,
        }
    }

    /// Inserts the user and returns how many users are online afterwards.
    ///
    /// A second registration under the same name silently replaces the first.
    pub async fn register(&self, username: &str, writer: SharedWriter<W>) -> usize {
        let mut users = self.users.lock().await;
        if users.insert(username.to_string(), writer).is_some() {
            debug!(%username, "username re-registered, previous channel replaced");
        }
        users.len()
    }

    /// Removes the user and closes its channel. Unknown names are ignored.
    pub async fn deregister(&self, username: &str) {
        let removed = self.users.lock().await.remove(username);
        if let Some(writer) = removed {
            close_writer(username, &writer).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.users.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.lock().await.is_empty()
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.users.lock().await.contains_key(username)
    }

    /// Sends `message` to every registered user and returns how many writes
    /// succeeded.
    ///
    /// A recipient whose write fails or exceeds the write timeout is removed
    /// once every recipient has been attempted; nobody else is affected.
    pub async fn broadcast(&self, message: &str) -> usize {
        let recipients = self.snapshot().await;

        let attempts = recipients.iter().map(|(username, writer)| async move {
            let delivered = timeout(self.write_timeout, async {
                writer.lock().await.write_line(message).await
            })
            .await;

            match delivered {
                Ok(Ok(())) => true,
                Ok(Err(err)) => {
                    warn!(%username, error = ?err, "failed to write to client");
                    false
                }
                Err(_) => {
                    warn!(%username, timeout = ?self.write_timeout, "write to client timed out");
                    false
                }
            }
        });
        let outcomes = join_all(attempts).await;

        let mut delivered = 0;
        let mut failed = Vec::new();
        for ((username, writer), ok) in recipients.into_iter().zip(outcomes) {
            if ok {
                delivered += 1;
            } else {
                failed.push((username, writer));
            }
        }

        for (username, writer) in failed {
            self.remove_entry(&username, &writer).await;
        }

        delivered
    }

    async fn snapshot(&self) -> Vec<(String, SharedWriter<W>)> {
        self.users
            .lock()
            .await
            .iter()
            .map(|(username, writer)| (username.clone(), Arc::clone(writer)))
            .collect()
    }

    // Only drops the mapping if it still points at the channel that failed;
    // the name may have been re-registered while the broadcast ran.
    async fn remove_entry(&self, username: &str, writer: &SharedWriter<W>) {
        let removed = {
            let mut users = self.users.lock().await;
            match users.get(username) {
                Some(current) if Arc::ptr_eq(current, writer) => users.remove(username),
                _ => None,
            }
        };

        match removed {
            Some(writer) => close_writer(username, &writer).await,
            None => close_writer(username, writer).await,
        }
    }
}

async fn close_writer<W>(username: &str, writer: &SharedWriter<W>)
where
    W: AsyncWrite + Unpin,
{
    if let Err(err) = writer.lock().await.close().await {
        debug!(%username, error = ?err, "error while closing client channel, ignoring");
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{BufReader, DuplexStream, ReadHalf};

    use super::*;
    use crate::protocol::LineReader;

    const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

    fn channel() -> (SharedWriter<DuplexStream>, LineReader<BufReader<ReadHalf<DuplexStream>>>) {
        let (local, remote) = tokio::io::duplex(1024);
        let (remote_read, _remote_write) = tokio::io::split(remote);
        (
            shared_writer(LineWriter::new(local)),
            LineReader::new(BufReader::new(remote_read)),
        )
    }

    #[tokio::test]
    async fn deregistered_users_miss_later_broadcasts() {
        let registry = UserRegistry::new(WRITE_TIMEOUT);
        let (alice, mut alice_rx) = channel();
        let (bob, mut bob_rx) = channel();

        registry.register("alice", alice).await;
        registry.register("bob", bob).await;
        registry.deregister("bob").await;

        assert_eq!(registry.broadcast("hello\n").await, 1);
        assert!(!registry.contains("bob").await);
        assert_eq!(alice_rx.read_line().await.unwrap().as_deref(), Some("hello\n"));
        // Deregistering closed bob's channel, so his stream ends without the message.
        assert_eq!(bob_rx.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn failing_recipient_does_not_block_others() {
        let registry = UserRegistry::new(WRITE_TIMEOUT);
        let (local, remote) = tokio::io::duplex(1024);
        drop(remote);
        let broken = shared_writer(LineWriter::new(local));
        let (bob, mut bob_rx) = channel();
        let (carol, mut carol_rx) = channel();

        registry.register("alice", broken).await;
        registry.register("bob", bob).await;
        registry.register("carol", carol).await;

        assert_eq!(registry.broadcast("ping\n").await, 2);
        assert_eq!(bob_rx.read_line().await.unwrap().as_deref(), Some("ping\n"));
        assert_eq!(carol_rx.read_line().await.unwrap().as_deref(), Some("ping\n"));
        assert!(!registry.contains("alice").await);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn deregister_twice_is_a_no_op() {
        let registry = UserRegistry::new(WRITE_TIMEOUT);
        let (alice, _alice_rx) = channel();

        registry.register("alice", alice).await;
        registry.deregister("alice").await;
        registry.deregister("alice").await;

        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_username_overwrites_previous_channel() {
        let registry = UserRegistry::new(WRITE_TIMEOUT);
        let (first, _first_rx) = channel();
        let (second, mut second_rx) = channel();

        assert_eq!(registry.register("alice", first).await, 1);
        assert_eq!(registry.register("alice", second).await, 1);

        registry.broadcast("hi\n").await;
        assert_eq!(second_rx.read_line().await.unwrap().as_deref(), Some("hi\n"));
    }
}
