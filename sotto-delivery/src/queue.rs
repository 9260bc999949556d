// SPDX-License-Identifier: MIT OR Apache-2.0

//! Queueing and retrying of outgoing group messages.
//!
//! A message is encrypted and handed to the transport right away. When the
//! transport fails (or times out), the composed plaintext is parked in a
//! per-group FIFO queue, persisted to the local durable cache, and retried
//! on a fixed interval by a task that only exists while its queue is
//! non-empty. Retries are bounded; a message that exhausts its budget is
//! dropped with a terminal [`DeliveryEvent::Failed`] signal.
//!
//! Each attempt re-runs encryption with a fresh message key and the current
//! group membership, so a message retried after a membership change is
//! wrapped for the members of that moment. A send that was acknowledged by
//! the server but lost its acknowledgement will be retried and delivered
//! twice; receivers deduplicate on the message id.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use sotto_core::cbor::EncodeError;
use sotto_core::{GroupId, MessageId, Timestamp, UserId};
use sotto_encryption::{EncryptError, Rng, encrypt_for_group};

use crate::events::DeliveryEvent;
use crate::traits::{GroupDirectory, QueueStore, Transport};

/// How often delivery of one message is retried before it is dropped.
pub const MAX_RETRIES: u32 = 3;

/// Interval between retry attempts on a group's queue.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// One composed but not yet delivered message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMessage {
    /// The composed plaintext. Kept until the message is delivered or
    /// dropped, so a transport outage never loses user input.
    pub content: String,

    /// How many retry attempts this message has been through.
    pub attempts: u32,

    /// When the message was parked in the queue.
    pub enqueued_at: Timestamp,
}

impl PendingMessage {
    fn new(content: String) -> Self {
        Self {
            content,
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }
}

/// Tunables of the delivery queue.
#[derive(Clone, Debug)]
pub struct DeliveryConfig {
    pub max_retries: u32,
    pub retry_interval: Duration,

    /// How long a single transport attempt may take before it counts as
    /// failed.
    pub send_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            retry_interval: RETRY_INTERVAL,
            send_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of handing a message to [`DeliveryQueue::send`].
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The transport acknowledged the message immediately.
    Delivered(MessageId),

    /// The transport failed; the message waits in the retry queue.
    Queued,
}

/// Sends messages towards groups, with crash-safe bounded retries.
///
/// Cheap to clone; all clones share the same queues and retry tasks.
#[derive(Debug)]
pub struct DeliveryQueue<T, S, D> {
    shared: Arc<Shared<T, S, D>>,
}

impl<T, S, D> Clone for DeliveryQueue<T, S, D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[derive(Debug)]
struct Shared<T, S, D> {
    local_user: UserId,
    config: DeliveryConfig,
    transport: T,
    store: S,
    directory: D,
    rng: Arc<Rng>,
    queues: StdMutex<HashMap<GroupId, Arc<Mutex<VecDeque<PendingMessage>>>>>,
    tasks: StdMutex<HashMap<GroupId, JoinHandle<()>>>,
    events: broadcast::Sender<DeliveryEvent>,
}

impl<T, S, D> DeliveryQueue<T, S, D>
where
    T: Transport + Send + Sync + 'static,
    S: QueueStore + Send + Sync + 'static,
    D: GroupDirectory + Send + Sync + 'static,
{
    pub fn new(local_user: UserId, transport: T, store: S, directory: D, rng: Arc<Rng>) -> Self {
        Self::with_config(
            local_user,
            transport,
            store,
            directory,
            rng,
            DeliveryConfig::default(),
        )
    }

    pub fn with_config(
        local_user: UserId,
        transport: T,
        store: S,
        directory: D,
        rng: Arc<Rng>,
        config: DeliveryConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                local_user,
                config,
                transport,
                store,
                directory,
                rng,
                queues: StdMutex::new(HashMap::new()),
                tasks: StdMutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Subscribe to user-visible delivery signals.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.shared.events.subscribe()
    }

    /// Encrypts and sends a message to a group.
    ///
    /// A transport failure (or timeout) parks the message in the group's
    /// retry queue and returns [`SendOutcome::Queued`]; only encryption and
    /// member-lookup failures are surfaced as errors, those are not
    /// retryable.
    pub async fn send(
        &self,
        group_id: &GroupId,
        content: &str,
    ) -> Result<SendOutcome, SendError> {
        let queue = self.shared.group_queue(group_id);
        let mut queue_guard = queue.lock().await;

        // A new message must never overtake ones already waiting for this
        // group, so the immediate attempt only happens on an empty queue.
        if queue_guard.is_empty() {
            match self.shared.attempt_transmit(group_id, content).await {
                Ok(message_id) => {
                    debug!(group = %group_id, message = %message_id, "message delivered");
                    return Ok(SendOutcome::Delivered(message_id));
                }
                Err(AttemptError::Encryption(err)) => return Err(SendError::Encryption(err)),
                Err(AttemptError::Encoding(err)) => return Err(SendError::Encoding(err)),
                Err(AttemptError::Directory(reason)) => {
                    return Err(SendError::Directory(reason));
                }
                Err(AttemptError::Transport(reason)) => {
                    warn!(group = %group_id, "send failed, queueing for retry: {reason}");
                }
            }
        }

        queue_guard.push_back(PendingMessage::new(content.to_string()));
        self.shared.persist(group_id, &queue_guard).await;
        drop(queue_guard);

        let _ = self.shared.events.send(DeliveryEvent::Queued {
            group_id: group_id.clone(),
        });
        self.shared.ensure_retry_task(group_id.clone());

        Ok(SendOutcome::Queued)
    }

    /// Reloads every persisted queue from the durable cache and resumes
    /// their retry tasks. Call once at startup; returns the number of
    /// messages picked up again.
    pub async fn restore(&self) -> Result<usize, PersistenceError> {
        let group_ids = self
            .shared
            .store
            .group_ids()
            .await
            .map_err(|err| PersistenceError(err.to_string()))?;

        let mut restored = 0;
        for group_id in group_ids {
            let messages = self
                .shared
                .store
                .read_queue(&group_id)
                .await
                .map_err(|err| PersistenceError(err.to_string()))?;
            if messages.is_empty() {
                continue;
            }

            restored += messages.len();
            let queue = self.shared.group_queue(&group_id);
            queue.lock().await.extend(messages);

            debug!(group = %group_id, "resuming persisted queue");
            self.shared.ensure_retry_task(group_id);
        }

        Ok(restored)
    }

    /// Number of messages currently waiting for a group.
    pub async fn pending(&self, group_id: &GroupId) -> usize {
        self.shared.group_queue(group_id).lock().await.len()
    }

    /// Stops all retry tasks. Queues stay persisted and are picked up again
    /// by [`DeliveryQueue::restore`] on the next start.
    pub fn shutdown(&self) {
        let mut tasks = self
            .shared
            .tasks
            .lock()
            .expect("acquire exclusive access on task table");
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}

impl<T, S, D> Shared<T, S, D>
where
    T: Transport + Send + Sync + 'static,
    S: QueueStore + Send + Sync + 'static,
    D: GroupDirectory + Send + Sync + 'static,
{
    /// Encrypts the message for the group's current members and hands it to
    /// the transport once.
    async fn attempt_transmit(
        &self,
        group_id: &GroupId,
        content: &str,
    ) -> Result<MessageId, AttemptError> {
        let members = match self.directory.members(group_id).await {
            Ok(members) => members,
            Err(err) => return Err(AttemptError::Directory(err.to_string())),
        };

        // Fresh message key and current membership on every attempt.
        let package = encrypt_for_group(
            content.as_bytes(),
            group_id,
            &members,
            &self.local_user,
            &self.rng,
        )
        .map_err(AttemptError::Encryption)?;
        let payload = package.to_bytes().map_err(AttemptError::Encoding)?;

        match tokio::time::timeout(
            self.config.send_timeout,
            self.transport.transmit(group_id, &payload),
        )
        .await
        {
            Ok(Ok(())) => Ok(package.message_id()),
            Ok(Err(err)) => Err(AttemptError::Transport(err.to_string())),
            // A timed-out send is indistinguishable from a failed one.
            Err(_) => Err(AttemptError::Transport(format!(
                "no acknowledgement within {:?}",
                self.config.send_timeout
            ))),
        }
    }

    /// Spawns the retry task for a group unless one is already running.
    fn ensure_retry_task(self: &Arc<Self>, group_id: GroupId) {
        let mut tasks = self
            .tasks
            .lock()
            .expect("acquire exclusive access on task table");
        if let Some(handle) = tasks.get(&group_id) {
            if !handle.is_finished() {
                return;
            }
        }

        let shared = Arc::clone(self);
        let task_group_id = group_id.clone();
        let handle = tokio::spawn(async move {
            shared.retry_loop(task_group_id).await;
        });
        tasks.insert(group_id, handle);
    }

    /// Works through a group's queue until it is drained, one attempt on the
    /// head message per interval.
    async fn retry_loop(self: Arc<Self>, group_id: GroupId) {
        debug!(group = %group_id, "retry task started");
        loop {
            tokio::time::sleep(self.config.retry_interval).await;

            let queue = self.group_queue(&group_id);
            let mut queue_guard = queue.lock().await;

            // Only ever the head; later messages wait until it is resolved.
            if let Some(head) = queue_guard.front_mut() {
                head.attempts += 1;
                let attempts = head.attempts;
                let content = head.content.clone();
                self.persist(&group_id, &queue_guard).await;

                match self.attempt_transmit(&group_id, &content).await {
                    Ok(message_id) => {
                        queue_guard.pop_front();
                        self.persist(&group_id, &queue_guard).await;
                        debug!(group = %group_id, message = %message_id, attempts,
                            "queued message delivered");
                        if attempts > 1 {
                            let _ = self.events.send(DeliveryEvent::Delivered {
                                group_id: group_id.clone(),
                                message_id,
                            });
                        }
                    }
                    Err(AttemptError::Encryption(_) | AttemptError::Encoding(_)) => {
                        // Not retryable: indicates a fault in this process,
                        // not in the network.
                        warn!(group = %group_id, "dropping message, encryption failed");
                        queue_guard.pop_front();
                        self.persist(&group_id, &queue_guard).await;
                        let _ = self.events.send(DeliveryEvent::Failed {
                            group_id: group_id.clone(),
                            content,
                        });
                    }
                    Err(
                        AttemptError::Transport(reason) | AttemptError::Directory(reason),
                    ) => {
                        if attempts >= self.config.max_retries {
                            warn!(group = %group_id, attempts,
                                "message could not be sent, giving up: {reason}");
                            queue_guard.pop_front();
                            self.persist(&group_id, &queue_guard).await;
                            let _ = self.events.send(DeliveryEvent::Failed {
                                group_id: group_id.clone(),
                                content,
                            });
                        } else {
                            debug!(group = %group_id, attempts,
                                "retry failed, message stays at head: {reason}");
                        }
                    }
                }
            }

            if queue_guard.is_empty() {
                // Deregister while still holding the queue lock so a
                // concurrent send either sees the running task or a vacant
                // slot, never a task that is about to exit.
                let mut tasks = self
                    .tasks
                    .lock()
                    .expect("acquire exclusive access on task table");
                tasks.remove(&group_id);
                debug!(group = %group_id, "retry task finished, queue drained");
                return;
            }
        }
    }

    fn group_queue(&self, group_id: &GroupId) -> Arc<Mutex<VecDeque<PendingMessage>>> {
        let mut queues = self
            .queues
            .lock()
            .expect("acquire exclusive access on queue table");
        queues.entry(group_id.clone()).or_default().clone()
    }

    /// Writes the current queue snapshot to the durable cache.
    async fn persist(&self, group_id: &GroupId, queue: &VecDeque<PendingMessage>) {
        let snapshot: Vec<PendingMessage> = queue.iter().cloned().collect();
        let mut store = self.store.clone();
        if let Err(err) = store.write_queue(group_id, &snapshot).await {
            // The in-memory queue keeps retrying; only the on-disk snapshot
            // is stale until the next write goes through.
            warn!(group = %group_id, "could not persist queue snapshot: {err}");
        }
    }
}

/// Why a single transmit attempt did not go through.
#[derive(Debug)]
enum AttemptError {
    Encryption(EncryptError),
    Encoding(EncodeError),
    Directory(String),
    Transport(String),
}

#[derive(Debug, Error)]
pub enum SendError {
    /// The message could not be encrypted. Not retried; indicates a
    /// programming or entropy-source fault.
    #[error(transparent)]
    Encryption(#[from] EncryptError),

    #[error("message package could not be encoded: {0}")]
    Encoding(#[from] EncodeError),

    /// The group's member list could not be read from the backing store.
    #[error("group member lookup failed: {0}")]
    Directory(String),
}

/// The local durable cache failed while restoring queues.
#[derive(Debug, Error)]
#[error("durable queue cache failed: {0}")]
pub struct PersistenceError(String);

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use sotto_core::{GroupId, UserId};
    use sotto_encryption::{EncryptedMessagePackage, Rng, decrypt_for_group};

    use crate::events::DeliveryEvent;
    use crate::memory::{MemoryGroupDirectory, MemoryQueueStore, MemoryTransport};
    use crate::traits::QueueStore;

    use super::{DeliveryQueue, SendOutcome};

    fn queue_fixture(
        transport: MemoryTransport,
        store: MemoryQueueStore,
    ) -> DeliveryQueue<MemoryTransport, MemoryQueueStore, MemoryGroupDirectory> {
        let directory = MemoryGroupDirectory::new();
        directory.insert(
            GroupId::from("g1"),
            vec![UserId::from("alice"), UserId::from("bob")],
        );
        DeliveryQueue::new(
            UserId::from("carol"),
            transport,
            store,
            directory,
            Arc::new(Rng::from_seed([1; 32])),
        )
    }

    #[tokio::test]
    async fn immediate_send_reaches_the_transport() {
        let transport = MemoryTransport::new();
        let queue = queue_fixture(transport.clone(), MemoryQueueStore::new());
        let group = GroupId::from("g1");

        let outcome = queue.send(&group, "hello").await.unwrap();
        assert!(matches!(outcome, SendOutcome::Delivered(_)));
        assert_eq!(queue.pending(&group).await, 0);

        // The transport saw a decryptable package addressed to the members.
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let package = EncryptedMessagePackage::from_bytes(&sent[0].1).unwrap();
        let plaintext = decrypt_for_group(&package, &group, &UserId::from("bob")).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_queues_and_retries() {
        let transport = MemoryTransport::new();
        let store = MemoryQueueStore::new();
        let queue = queue_fixture(transport.clone(), store.clone());
        let group = GroupId::from("g1");

        transport.set_online(false);
        let outcome = queue.send(&group, "hello").await.unwrap();
        assert_eq!(outcome, SendOutcome::Queued);
        assert_eq!(queue.pending(&group).await, 1);

        // The snapshot hit the durable cache before send() returned.
        let snapshot = store.read_queue(&group).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].content, "hello");
        assert_eq!(snapshot[0].attempts, 0);

        transport.set_online(true);
        tokio::time::sleep(Duration::from_millis(10_100)).await;

        assert_eq!(queue.pending(&group).await, 0);
        assert_eq!(transport.sent().len(), 1);
        assert!(store.read_queue(&group).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_confirmation_after_a_failed_retry() {
        let transport = MemoryTransport::new();
        let queue = queue_fixture(transport.clone(), MemoryQueueStore::new());
        let group = GroupId::from("g1");
        let mut events = queue.subscribe();

        transport.set_online(false);
        queue.send(&group, "hello").await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            DeliveryEvent::Queued {
                group_id: group.clone()
            }
        );

        // First retry fails too, second one goes through.
        tokio::time::sleep(Duration::from_millis(10_100)).await;
        transport.set_online(true);
        tokio::time::sleep(Duration::from_millis(10_100)).await;

        match events.recv().await.unwrap() {
            DeliveryEvent::Delivered { group_id, .. } => assert_eq!(group_id, group),
            other => panic!("expected delivery confirmation, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let transport = MemoryTransport::new();
        let store = MemoryQueueStore::new();
        let queue = queue_fixture(transport.clone(), store.clone());
        let group = GroupId::from("g1");
        let mut events = queue.subscribe();

        transport.set_online(false);
        queue.send(&group, "doomed").await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            DeliveryEvent::Queued {
                group_id: group.clone()
            }
        );

        // Let every retry burn through.
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(
            events.recv().await.unwrap(),
            DeliveryEvent::Failed {
                group_id: group.clone(),
                content: "doomed".to_string()
            }
        );
        assert_eq!(queue.pending(&group).await, 0);
        assert!(store.read_queue(&group).await.unwrap().is_empty());

        // One immediate attempt plus three retries, then nothing more.
        assert_eq!(transport.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fifo_order_is_preserved_per_group() {
        let transport = MemoryTransport::new();
        let queue = queue_fixture(transport.clone(), MemoryQueueStore::new());
        let group = GroupId::from("g1");

        transport.set_online(false);
        queue.send(&group, "first").await.unwrap();
        queue.send(&group, "second").await.unwrap();

        // Only the head message was ever attempted while the queue was
        // backed up.
        assert_eq!(transport.attempts(), 1);
        assert_eq!(queue.pending(&group).await, 2);

        transport.set_online(true);
        tokio::time::sleep(Duration::from_millis(30_100)).await;

        let carol = UserId::from("carol");
        let contents: Vec<Vec<u8>> = transport
            .sent()
            .iter()
            .map(|(group_id, payload)| {
                let package = EncryptedMessagePackage::from_bytes(payload).unwrap();
                decrypt_for_group(&package, group_id, &carol).unwrap()
            })
            .collect();
        assert_eq!(contents, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_persisted_between_retries() {
        let transport = MemoryTransport::new();
        let store = MemoryQueueStore::new();
        let queue = queue_fixture(transport.clone(), store.clone());
        let group = GroupId::from("g1");

        transport.set_online(false);
        queue.send(&group, "hello").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10_100)).await;

        let snapshot = store.read_queue(&group).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restore_resumes_persisted_queues() {
        let transport = MemoryTransport::new();
        let store = MemoryQueueStore::new();
        let group = GroupId::from("g1");

        // First process run: message gets stuck in the queue.
        {
            let queue = queue_fixture(transport.clone(), store.clone());
            transport.set_online(false);
            queue.send(&group, "survivor").await.unwrap();
            queue.shutdown();
        }

        // Second process run over the same durable cache.
        transport.set_online(true);
        let queue = queue_fixture(transport.clone(), store.clone());
        let restored = queue.restore().await.unwrap();
        assert_eq!(restored, 1);

        tokio::time::sleep(Duration::from_millis(10_100)).await;

        assert_eq!(queue.pending(&group).await, 0);
        assert_eq!(transport.sent().len(), 1);
        assert!(store.read_queue(&group).await.unwrap().is_empty());
    }
}
