//! Fulcrum: chat message lifecycle engine with change-feed reconciliation.

pub mod app;
pub mod chat;
pub mod config;
pub mod engine;
pub mod persistence;
pub mod store;
pub mod sync;
