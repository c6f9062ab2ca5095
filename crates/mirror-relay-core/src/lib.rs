//! Core types, config, errors, wire protocol and snapshot model for Mirror Relay.

pub mod backend;
pub mod command;
pub mod config;
pub mod error;
pub mod pending;
pub mod protocol;
pub mod reconnect;
pub mod snapshot;
pub mod types;
