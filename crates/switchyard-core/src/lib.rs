//! Core types, wire protocol, config, and errors for Switchyard.

pub mod config;
pub mod error;
pub mod partial_json;
pub mod protocol;
pub mod types;
