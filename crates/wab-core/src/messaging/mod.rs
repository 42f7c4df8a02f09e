//! WhatsApp protocol abstractions.
//!
//! The wire protocol lives in an external implementation; the bot only sees the
//! port defined here.

pub mod port;
pub mod throttled;
pub mod types;
