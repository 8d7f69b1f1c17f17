//! At-least-once batch queue with leases, visibility timeouts, long polling,
//! and a dead-letter area for poison messages.

pub mod lease_queue;

pub use lease_queue::{
    DeadLetter, Delivery, FailureDisposition, Lease, LeaseQueue, LeaseQueueParams, QueueError,
    QueueStats,
};
