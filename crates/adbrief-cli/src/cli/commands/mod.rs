//! CLI command handlers.

pub mod chat;
pub mod config;
pub mod docs;
pub mod proxy;
