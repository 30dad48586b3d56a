//! Core types, config, errors, and request validation for relaychat.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;
pub mod validate;
