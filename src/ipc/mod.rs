//! Inter-Process Communication
//!
//! Synchronous endpoints, asynchronous notifications, reply objects and
//! the message-transfer machinery between them.
//!
//! # Design
//! - Endpoints are pure rendezvous points: no buffering, ever; a message
//!   moves only when a sender and a receiver are both committed
//!   ([`endpoint`])
//! - Notifications are word-sized signal accumulators with an optional
//!   bound thread and a donatable scheduling context ([`notification`])
//! - Reply objects form per-context call stacks so scheduling-context
//!   donation unwinds correctly even when servers fault mid-call
//!   ([`reply`])
//! - Faults are IPC messages the kernel composes on a thread's behalf
//!   ([`fault`])
//!
//! # Security Properties
//! - A transfer grants capabilities only when the endpoint capability used
//!   to send carries the grant right
//! - Badges are set at mint time and cannot be altered by the sender

pub mod endpoint;
pub mod fault;
pub mod notification;
pub mod reply;
pub mod transfer;

pub use endpoint::{Endpoint, EpState};
pub use fault::Fault;
pub use notification::{Notification, NtfnState};
pub use reply::Reply;
