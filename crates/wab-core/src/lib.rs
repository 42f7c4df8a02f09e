//! Core domain + application logic for the multi-session WhatsApp bot.
//!
//! This crate is framework-agnostic. The WhatsApp protocol lives behind
//! [`messaging::port`] traits implemented in adapter crates; the HTTP
//! control surface is served by `wab-http`.

pub mod config;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod messaging;
pub mod plugins;
pub mod scheduler;
pub mod security;
pub mod services;
pub mod session;
pub mod settings;
pub mod utils;
pub mod vault;
pub mod vcf;

#[cfg(test)]
mod test_support;

pub use errors::{Error, Result};
