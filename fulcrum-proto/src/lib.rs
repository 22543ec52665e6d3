//! Shared data model for the Fulcrum chat engine.

pub mod feed;
pub mod message;
