// SPDX-License-Identifier: MIT OR Apache-2.0

//! Time-bound destruction of message content.
//!
//! Every message armed with a non-zero TTL gets an entry in an arena keyed
//! by message id. A single worker task drives all expirations off a deadline
//! min-heap; there is no per-message OS timer. Re-arming a message id
//! replaces its entry, stale heap slots are skipped via a generation
//! counter.
//!
//! Firing happens exactly once per entry. The destruction callback runs on
//! the worker task; a panicking callback is caught and logged so it cannot
//! stall the remaining timers.
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use sotto_core::{ConversationId, MessageId};

/// Destruction callback invoked when a message's TTL elapses.
pub type ExpireCallback = Box<dyn FnOnce() + Send + 'static>;

struct TtlEntry {
    expires_at: Instant,
    generation: u64,
    on_expire: ExpireCallback,
}

#[derive(Default)]
struct TtlState {
    entries: HashMap<MessageId, TtlEntry>,
    deadlines: BinaryHeap<Reverse<(Instant, u64, MessageId)>>,
    conversation_defaults: HashMap<ConversationId, u64>,
    global_default: u64,
    next_generation: u64,
}

/// Schedules irreversible, time-bound destruction of message content.
///
/// Must be created inside a tokio runtime; the expiration worker runs until
/// [`TtlScheduler::dispose`] is called or the scheduler is dropped.
pub struct TtlScheduler {
    state: Arc<StdMutex<TtlState>>,
    notify: Arc<Notify>,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl TtlScheduler {
    pub fn new() -> Self {
        let state = Arc::new(StdMutex::new(TtlState::default()));
        let notify = Arc::new(Notify::new());
        let worker = tokio::spawn(worker_loop(Arc::clone(&state), Arc::clone(&notify)));

        Self {
            state,
            notify,
            worker: StdMutex::new(Some(worker)),
        }
    }

    /// Arms (or re-arms) the expiration timer of a message.
    ///
    /// A non-zero `expiration_seconds` schedules `on_expire` to run exactly
    /// once, cancelling and replacing any timer previously armed for the
    /// same id. Zero means "never expires" and clears an existing timer;
    /// the callback is dropped unused in that case.
    pub fn arm(
        &self,
        message_id: MessageId,
        expiration_seconds: u64,
        on_expire: impl FnOnce() + Send + 'static,
    ) {
        self.arm_boxed(message_id, expiration_seconds, Box::new(on_expire));
    }

    fn arm_boxed(
        &self,
        message_id: MessageId,
        expiration_seconds: u64,
        on_expire: ExpireCallback,
    ) {
        if expiration_seconds == 0 {
            self.cancel(message_id);
            return;
        }

        let expires_at = Instant::now() + Duration::from_secs(expiration_seconds);
        {
            let mut state = self.lock_state();
            let generation = state.next_generation;
            state.next_generation += 1;

            // Replaces (and thereby cancels) any previous timer for this id;
            // the old heap slot dies on its mismatching generation.
            state.entries.insert(
                message_id,
                TtlEntry {
                    expires_at,
                    generation,
                    on_expire,
                },
            );
            state
                .deadlines
                .push(Reverse((expires_at, generation, message_id)));
        }
        self.notify.notify_one();
    }

    /// Drops a message's timer without firing it, for messages that are
    /// deleted through other means before their TTL elapses.
    pub fn cancel(&self, message_id: MessageId) {
        let removed = self.lock_state().entries.remove(&message_id).is_some();
        if removed {
            self.notify.notify_one();
        }
    }

    /// Whole seconds until the message expires; `0` for unknown ids and for
    /// messages about to expire.
    pub fn remaining_seconds(&self, message_id: MessageId) -> u64 {
        self.lock_state()
            .entries
            .get(&message_id)
            .map(|entry| {
                entry
                    .expires_at
                    .saturating_duration_since(Instant::now())
                    .as_secs()
            })
            .unwrap_or(0)
    }

    /// Sets the default TTL for new messages of a conversation. Zero removes
    /// the conversation-specific default.
    pub fn set_conversation_default(
        &self,
        conversation_id: ConversationId,
        expiration_seconds: u64,
    ) {
        let mut state = self.lock_state();
        if expiration_seconds == 0 {
            state.conversation_defaults.remove(&conversation_id);
        } else {
            state
                .conversation_defaults
                .insert(conversation_id, expiration_seconds);
        }
    }

    /// The TTL a new message in this conversation gets when it does not
    /// specify its own, falling back to the process-wide default.
    pub fn default_for(&self, conversation_id: &ConversationId) -> u64 {
        let state = self.lock_state();
        state
            .conversation_defaults
            .get(conversation_id)
            .copied()
            .unwrap_or(state.global_default)
    }

    /// Sets the process-wide default TTL. Zero means no expiration.
    pub fn set_global_default(&self, expiration_seconds: u64) {
        self.lock_state().global_default = expiration_seconds;
    }

    /// Arms every listed message with the same TTL and makes it the
    /// conversation default.
    ///
    /// A bulk convenience, not a transaction: each arm call is independent
    /// and `on_expire` is invoked with the id of whichever message expired.
    pub fn apply_to_conversation(
        &self,
        conversation_id: ConversationId,
        message_ids: &[MessageId],
        expiration_seconds: u64,
        on_expire: impl Fn(MessageId) + Clone + Send + 'static,
    ) {
        for &message_id in message_ids {
            let callback = on_expire.clone();
            self.arm_boxed(
                message_id,
                expiration_seconds,
                Box::new(move || callback(message_id)),
            );
        }
        self.set_conversation_default(conversation_id, expiration_seconds);
    }

    /// Cancels all live timers and stops the worker. Required at shutdown to
    /// avoid dangling wakeups; the scheduler is unusable afterwards.
    pub fn dispose(&self) {
        if let Some(worker) = self
            .worker
            .lock()
            .expect("acquire exclusive access on worker handle")
            .take()
        {
            worker.abort();
        }

        let mut state = self.lock_state();
        state.entries.clear();
        state.deadlines.clear();
        state.conversation_defaults.clear();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TtlState> {
        self.state
            .lock()
            .expect("acquire exclusive access on scheduler state")
    }
}

impl Default for TtlScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TtlScheduler {
    fn drop(&mut self) {
        if let Some(worker) = self
            .worker
            .lock()
            .expect("acquire exclusive access on worker handle")
            .take()
        {
            worker.abort();
        }
    }
}

impl fmt::Debug for TtlScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("TtlScheduler")
            .field("armed", &state.entries.len())
            .field("conversation_defaults", &state.conversation_defaults.len())
            .finish()
    }
}

async fn worker_loop(state: Arc<StdMutex<TtlState>>, notify: Arc<Notify>) {
    loop {
        let next_deadline = {
            let mut state = state.lock().expect("acquire exclusive access on scheduler state");
            prune_stale(&mut state);
            state
                .deadlines
                .peek()
                .map(|Reverse((deadline, _, _))| *deadline)
        };

        match next_deadline {
            None => notify.notified().await,
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        for (message_id, on_expire) in collect_due(&state) {
                            // One bad callback must not take down the
                            // remaining timers.
                            if catch_unwind(AssertUnwindSafe(on_expire)).is_err() {
                                warn!(message = %message_id, "expiration callback panicked");
                            } else {
                                debug!(message = %message_id, "message content expired");
                            }
                        }
                    }
                    // Something was armed or cancelled, recompute the
                    // nearest deadline.
                    _ = notify.notified() => {}
                }
            }
        }
    }
}

/// Drops heap slots whose entry was re-armed or cancelled in the meantime.
fn prune_stale(state: &mut TtlState) {
    while let Some(&Reverse((_, generation, message_id))) = state.deadlines.peek() {
        let live = state
            .entries
            .get(&message_id)
            .is_some_and(|entry| entry.generation == generation);
        if live {
            break;
        }
        state.deadlines.pop();
    }
}

/// Removes and returns all entries whose deadline has passed.
fn collect_due(state: &Arc<StdMutex<TtlState>>) -> Vec<(MessageId, ExpireCallback)> {
    let now = Instant::now();
    let mut due = Vec::new();

    let mut state = state.lock().expect("acquire exclusive access on scheduler state");
    while let Some(&Reverse((deadline, generation, message_id))) = state.deadlines.peek() {
        if deadline > now {
            break;
        }
        state.deadlines.pop();

        let live = state
            .entries
            .get(&message_id)
            .is_some_and(|entry| entry.generation == generation);
        if live {
            if let Some(entry) = state.entries.remove(&message_id) {
                due.push((message_id, entry.on_expire));
            }
        }
    }

    due
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use sotto_core::{ConversationId, MessageId};

    use super::TtlScheduler;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Clone + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook = {
            let count = Arc::clone(&count);
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };
        (count, hook)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_exactly_once_at_the_deadline() {
        let scheduler = TtlScheduler::new();
        let id = MessageId::random();
        let (fired, hook) = counter();

        scheduler.arm(id, 1, hook);
        assert_eq!(scheduler.remaining_seconds(id), 1);

        // Nothing happens before the deadline.
        tokio::time::sleep(Duration::from_millis(990)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.remaining_seconds(id), 0);

        // And never again.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_cancels_and_replaces() {
        let scheduler = TtlScheduler::new();
        let id = MessageId::random();
        let (fired_a, hook_a) = counter();
        let (fired_b, hook_b) = counter();

        scheduler.arm(id, 5, hook_a);
        scheduler.arm(id, 1, hook_b);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(fired_a.load(Ordering::SeqCst), 0);
        assert_eq!(fired_b.load(Ordering::SeqCst), 1);

        // The first timer is gone for good.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired_a.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_expiration_clears_an_armed_timer() {
        let scheduler = TtlScheduler::new();
        let id = MessageId::random();
        let (fired, hook) = counter();

        scheduler.arm(id, 2, hook.clone());
        scheduler.arm(id, 0, hook);
        assert_eq!(scheduler.remaining_seconds(id), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timers_never_fire() {
        let scheduler = TtlScheduler::new();
        let id = MessageId::random();
        let (fired, hook) = counter();

        scheduler.arm(id, 1, hook);
        scheduler.cancel(id);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_callback_does_not_stall_other_timers() {
        let scheduler = TtlScheduler::new();
        let (fired, hook) = counter();

        scheduler.arm(MessageId::random(), 1, || panic!("boom"));
        scheduler.arm(MessageId::random(), 2, hook);

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn conversation_defaults_fall_back_to_the_global_one() {
        let scheduler = TtlScheduler::new();
        let chat = ConversationId::from("c1");
        let other = ConversationId::from("c2");

        assert_eq!(scheduler.default_for(&chat), 0);

        scheduler.set_global_default(30);
        scheduler.set_conversation_default(chat.clone(), 60);
        assert_eq!(scheduler.default_for(&chat), 60);
        assert_eq!(scheduler.default_for(&other), 30);

        // Removing the conversation default falls back again.
        scheduler.set_conversation_default(chat.clone(), 0);
        assert_eq!(scheduler.default_for(&chat), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn apply_to_conversation_arms_each_message() {
        let scheduler = TtlScheduler::new();
        let chat = ConversationId::from("c1");
        let ids = [MessageId::random(), MessageId::random(), MessageId::random()];
        let expired = Arc::new(std::sync::Mutex::new(Vec::new()));

        let sink = Arc::clone(&expired);
        scheduler.apply_to_conversation(chat.clone(), &ids, 1, move |message_id| {
            sink.lock().unwrap().push(message_id);
        });
        assert_eq!(scheduler.default_for(&chat), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let mut seen = expired.lock().unwrap().clone();
        seen.sort();
        let mut wanted = ids.to_vec();
        wanted.sort();
        assert_eq!(seen, wanted);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_cancels_everything() {
        let scheduler = TtlScheduler::new();
        let (fired, hook) = counter();

        scheduler.arm(MessageId::random(), 1, hook);
        scheduler.dispose();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
