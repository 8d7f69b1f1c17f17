use std::collections::{HashMap, VecDeque};
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, Duration, Instant};

pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_POLL_WAIT: Duration = Duration::from_secs(20);
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 3;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_024;

const EXHAUSTED_ATTEMPTS_REASON: &str = "delivery attempts exhausted";

/// Errors surfaced by lease bookkeeping. A lease that expired and was swept
/// back into the visible queue is indistinguishable from one that never
/// existed, so both report as unknown.
#[derive(Debug, PartialEq, Eq)]
pub enum QueueError {
    UnknownLease { lease_id: u64 },
    UnknownDeadLetter { message_id: u64 },
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownLease { lease_id } => {
                write!(f, "lease {lease_id} is unknown or already expired")
            }
            Self::UnknownDeadLetter { message_id } => {
                write!(f, "dead-letter entry {message_id} does not exist")
            }
        }
    }
}

impl std::error::Error for QueueError {}

/// A consumer's time-bounded right to process one delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    id: u64,
}

impl Lease {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// One dequeued message plus the lease that must be completed, failed, or
/// extended before the visibility timeout elapses.
#[derive(Debug)]
pub struct Delivery<T> {
    message: T,
    lease: Lease,
    attempt: u32,
}

impl<T> Delivery<T> {
    pub fn message(&self) -> &T {
        &self.message
    }

    pub fn into_message(self) -> T {
        self.message
    }

    pub fn lease(&self) -> Lease {
        self.lease
    }

    /// 1-based delivery attempt for this message.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }
}

/// Outcome of failing a lease: the message went back to the visible queue or
/// crossed its attempt budget and was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Requeued { attempt: u32 },
    DeadLettered,
}

/// A message parked for manual operator intervention (replay or discard).
#[derive(Debug, Clone)]
pub struct DeadLetter<T> {
    message_id: u64,
    payload: T,
    attempts: u32,
    reason: String,
}

impl<T> DeadLetter<T> {
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Depth of each queue stage, for metrics and operator introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub visible: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct LeaseQueueParams {
    pub visibility_timeout: Duration,
    pub poll_wait: Duration,
    pub max_delivery_attempts: u32,
    pub capacity: usize,
}

impl Default for LeaseQueueParams {
    fn default() -> Self {
        Self {
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            poll_wait: DEFAULT_POLL_WAIT,
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

struct QueuedMessage<T> {
    message_id: u64,
    payload: T,
    attempts: u32,
}

struct InFlight<T> {
    message: QueuedMessage<T>,
    deadline: Instant,
}

struct QueueState<T> {
    ready: VecDeque<QueuedMessage<T>>,
    in_flight: HashMap<u64, InFlight<T>>,
    dead: Vec<DeadLetter<T>>,
    next_message_id: u64,
    next_lease_id: u64,
}

impl<T> QueueState<T> {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            in_flight: HashMap::new(),
            dead: Vec::new(),
            next_message_id: 0,
            next_lease_id: 0,
        }
    }

    /// Moves every lease whose deadline has passed back into the visible
    /// queue. Attempt counts were bumped at delivery, so the next dequeue of
    /// a swept message sees one more attempt.
    fn release_expired(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(lease_id, _)| *lease_id)
            .collect();
        for lease_id in expired {
            if let Some(entry) = self.in_flight.remove(&lease_id) {
                self.ready.push_back(entry.message);
            }
        }
    }

    fn nearest_deadline(&self) -> Option<Instant> {
        self.in_flight.values().map(|entry| entry.deadline).min()
    }

    fn held_messages(&self) -> usize {
        self.ready.len().saturating_add(self.in_flight.len())
    }
}

enum PollOutcome<T> {
    Delivered(Delivery<T>),
    Empty { nearest_expiry: Option<Instant> },
}

/// Async queue delivering messages at least once under leases. A lease that
/// is neither completed nor extended before the visibility timeout is
/// redelivered; a message that exhausts its delivery attempts is routed to
/// the dead-letter area instead of being delivered again.
pub struct LeaseQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    visibility_timeout: Duration,
    poll_wait: Duration,
    max_delivery_attempts: u32,
    capacity: usize,
}

impl<T> LeaseQueue<T> {
    pub fn new(params: LeaseQueueParams) -> Self {
        assert!(params.capacity > 0, "capacity must be greater than zero");
        assert!(
            params.max_delivery_attempts > 0,
            "max_delivery_attempts must be greater than zero"
        );
        Self {
            state: Mutex::new(QueueState::new()),
            notify: Notify::new(),
            visibility_timeout: params.visibility_timeout,
            poll_wait: params.poll_wait,
            max_delivery_attempts: params.max_delivery_attempts,
            capacity: params.capacity,
        }
    }

    /// Enqueues one message and returns its queue-assigned id. Waits while
    /// the queue already holds `capacity` messages (visible plus in-flight).
    pub async fn enqueue(&self, payload: T) -> u64 {
        let mut pending = Some(payload);
        loop {
            let notified = self.notify.notified();
            let mut state = self.state.lock().await;
            if state.held_messages() < self.capacity {
                let payload = pending
                    .take()
                    .expect("message should only be enqueued once");
                let message_id = state.next_message_id;
                state.next_message_id += 1;
                state.ready.push_back(QueuedMessage {
                    message_id,
                    payload,
                    attempts: 0,
                });
                drop(state);
                self.notify.notify_waiters();
                return message_id;
            }
            drop(state);
            notified.await;
        }
    }

    /// Completes a lease, removing its message permanently.
    pub async fn complete(&self, lease: Lease) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.release_expired(Instant::now());
        if state.in_flight.remove(&lease.id).is_some() {
            drop(state);
            self.notify.notify_waiters();
            Ok(())
        } else {
            Err(QueueError::UnknownLease { lease_id: lease.id })
        }
    }

    /// Pushes the lease deadline to `extension` from now.
    pub async fn extend_lease(&self, lease: Lease, extension: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.release_expired(now);
        match state.in_flight.get_mut(&lease.id) {
            Some(entry) => {
                entry.deadline = now + extension;
                Ok(())
            }
            None => Err(QueueError::UnknownLease { lease_id: lease.id }),
        }
    }

    /// Fails a lease: the message becomes visible again, unless its attempt
    /// budget is spent, in which case it is dead-lettered with `reason`.
    pub async fn fail(&self, lease: Lease, reason: &str) -> Result<FailureDisposition, QueueError> {
        let mut state = self.state.lock().await;
        state.release_expired(Instant::now());
        let entry = state
            .in_flight
            .remove(&lease.id)
            .ok_or(QueueError::UnknownLease { lease_id: lease.id })?;

        let message = entry.message;
        let disposition = if message.attempts >= self.max_delivery_attempts {
            state.dead.push(DeadLetter {
                message_id: message.message_id,
                payload: message.payload,
                attempts: message.attempts,
                reason: reason.to_string(),
            });
            FailureDisposition::DeadLettered
        } else {
            let attempt = message.attempts;
            state.ready.push_back(message);
            FailureDisposition::Requeued { attempt }
        };
        drop(state);
        self.notify.notify_waiters();
        Ok(disposition)
    }

    pub async fn stats(&self) -> QueueStats {
        let mut state = self.state.lock().await;
        state.release_expired(Instant::now());
        QueueStats {
            visible: state.ready.len(),
            in_flight: state.in_flight.len(),
            dead_lettered: state.dead.len(),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn is_empty(&self) -> bool {
        let state = self.state.lock().await;
        state.ready.is_empty() && state.in_flight.is_empty()
    }

    /// Drops every visible and dead-lettered message, returning how many
    /// were removed. Outstanding leases are left to drain normally.
    pub async fn purge(&self) -> usize {
        let mut state = self.state.lock().await;
        let removed = state.ready.len().saturating_add(state.dead.len());
        state.ready.clear();
        state.dead.clear();
        drop(state);
        self.notify.notify_waiters();
        removed
    }

    /// Removes a dead-letter entry without reprocessing it.
    pub async fn discard_dead_letter(&self, message_id: u64) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let index = state
            .dead
            .iter()
            .position(|entry| entry.message_id == message_id)
            .ok_or(QueueError::UnknownDeadLetter { message_id })?;
        state.dead.remove(index);
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Puts a dead-letter entry back into the visible queue with a fresh
    /// attempt budget.
    pub async fn replay_dead_letter(&self, message_id: u64) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let index = state
            .dead
            .iter()
            .position(|entry| entry.message_id == message_id)
            .ok_or(QueueError::UnknownDeadLetter { message_id })?;
        let entry = state.dead.remove(index);
        state.ready.push_back(QueuedMessage {
            message_id: entry.message_id,
            payload: entry.payload,
            attempts: 0,
        });
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }
}

impl<T: Clone> LeaseQueue<T> {
    /// Long-polls with the configured wait. Returns `None` when no message
    /// became visible before the poll deadline.
    pub async fn dequeue(&self) -> Option<Delivery<T>> {
        self.dequeue_timeout(self.poll_wait).await
    }

    /// Long-polls until `wait` elapses, waking early for new messages and
    /// for leases about to expire.
    pub async fn dequeue_timeout(&self, wait: Duration) -> Option<Delivery<T>> {
        let poll_deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            match self.poll_ready().await {
                PollOutcome::Delivered(delivery) => return Some(delivery),
                PollOutcome::Empty { nearest_expiry } => {
                    let wake_at = match nearest_expiry {
                        Some(expiry) => expiry.min(poll_deadline),
                        None => poll_deadline,
                    };
                    tokio::select! {
                        _ = notified => {}
                        _ = sleep_until(wake_at) => {
                            if Instant::now() >= poll_deadline {
                                return None;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Non-blocking dequeue attempt.
    pub async fn try_dequeue(&self) -> Option<Delivery<T>> {
        match self.poll_ready().await {
            PollOutcome::Delivered(delivery) => Some(delivery),
            PollOutcome::Empty { .. } => None,
        }
    }

    /// Snapshot of the dead-letter area for operator inspection.
    pub async fn dead_letters(&self) -> Vec<DeadLetter<T>> {
        self.state.lock().await.dead.clone()
    }

    async fn poll_ready(&self) -> PollOutcome<T> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.release_expired(now);

        while let Some(mut message) = state.ready.pop_front() {
            message.attempts += 1;
            if message.attempts > self.max_delivery_attempts {
                // Redelivered past its budget (expiry path): park it instead
                // of handing it out again.
                state.dead.push(DeadLetter {
                    message_id: message.message_id,
                    payload: message.payload,
                    attempts: message.attempts - 1,
                    reason: EXHAUSTED_ATTEMPTS_REASON.to_string(),
                });
                continue;
            }

            let lease = Lease {
                id: state.next_lease_id,
            };
            state.next_lease_id += 1;
            let delivery = Delivery {
                message: message.payload.clone(),
                lease,
                attempt: message.attempts,
            };
            state.in_flight.insert(
                lease.id,
                InFlight {
                    message,
                    deadline: now + self.visibility_timeout,
                },
            );
            return PollOutcome::Delivered(delivery);
        }

        PollOutcome::Empty {
            nearest_expiry: state.nearest_deadline(),
        }
    }
}
