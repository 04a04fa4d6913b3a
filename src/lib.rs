//! Quest orchestration core.
//!
//! Turns declarative quest definitions into scheduled or event-triggered
//! executions, keeps at most one execution per quest across instances, and
//! reports progress with milestone notifications.

pub mod config;
pub mod error;
pub mod lock;
pub mod notify;
pub mod progress;
pub mod quest;
pub mod store;
pub mod trigger;

pub use error::Error;
