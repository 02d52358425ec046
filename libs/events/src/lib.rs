//! # shadowsync-events
//!
//! The domain event model for shadowsync.
//!
//! ## Design Principles
//!
//! - Events are immutable records of device state transitions; only their
//!   delivery bookkeeping changes after append
//! - Every event belongs to exactly one tenant, and an event cannot be built
//!   without one
//! - Payloads are a closed sum type: each [`EventType`] has exactly one
//!   payload shape, checked at compile time
//! - Delivery state only moves forward (see [`DeliveryState::apply`])
//!
//! ## Event Types
//!
//! - `device-provisioned`: a device was created on an IoT hub
//! - `device-decommissioned`: a device was removed from an IoT hub
//! - `device-status-changed`: a known device changed status or reported state
//! - `device-shadow-updated`: desired shadow fields were pushed to a hub

mod error;
mod event;
mod filter;
mod types;

pub use error::EventError;
pub use event::*;
pub use filter::*;
pub use types::*;
