//! Core domain models for the herald delivery layer.
//!
//! Provides the delivery event record, per-channel results, strongly-typed
//! identifiers, and a clock abstraction. The delivery and API crates build
//! on these types so that every component agrees on event lifecycle and
//! serialization.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{Channel, DeliveryEvent, DeliveryResult, DeliveryStatus, EventId, TenantId};
pub use time::{Clock, RealClock, TestClock};
