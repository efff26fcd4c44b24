//! Relaygate - inbound management for an external proxy engine
//!
//! This library keeps a proxy engine's live configuration in sync with a
//! persisted set of inbound endpoints:
//! - Stores inbounds, accounts and settings in SQLite
//! - Validates inbound mutations and provisions viewer accounts for new labels
//! - Collapses bursts of changes into one rate-limited engine restart
//! - Supervises the engine as a local process fed a rendered JSON config
//! - Exposes a JSON management API over HTTP

pub mod admin;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod engine;
pub mod error;
pub mod inbound;
pub mod registry;
pub mod scheduler;
pub mod supervisor;
