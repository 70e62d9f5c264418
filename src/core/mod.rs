//! Shared primitives: configuration, storage, messages, and the ambient stack.
//!
//! Everything that touches SQLite goes through `broker`; everything that writes
//! an output table goes through `store`.

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod message;
pub mod output;
pub mod schemas;
pub mod source;
pub mod store;
pub mod time;
