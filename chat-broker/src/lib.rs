//! In-process chat message broker.
//!
//! Producers submit [`message::Message`] values into one bounded ingress
//! queue; a single dispatch loop drains it and pushes each message into the
//! mailbox of its recipient, or into every registered mailbox for broadcasts.
//! Everything stops when the caller-owned cancellation token fires.
//!
//! - [`broker`] owns the ingress queue, the dispatch loop and the lifecycle.
//! - [`registry`] maps user ids to mailboxes behind a reader/writer lock.
//! - [`mailbox`] wraps the bounded or unbounded channel a consumer drains.
//! - [`message`] defines the message value plus JSON-lines helpers.
//! - [`config`] and [`error`] hold broker settings and failure types.
//! - [`cli`] parses arguments for the bundled demo binary.
//!
//! Delivery is best effort: unicast messages for unknown users and anything
//! still queued at shutdown are dropped without notice.

pub mod broker;
pub mod cli;
pub mod config;
pub mod error;
pub mod mailbox;
pub mod message;
pub mod registry;
