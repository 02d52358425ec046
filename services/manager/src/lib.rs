//! shadowsync manager library.
//!
//! Keeps a tenant-scoped log of device lifecycle events, pushes device
//! changes to device-shadow hubs, and delivers recorded events to
//! downstream consumers with retry and backoff.
//!
//! The crate ships the `shadowsync` binary; the library surface exists for
//! integration testing and embedding.

pub mod api;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod fleet;
pub mod integrations;
pub mod reconciler;
pub mod shadow;
pub mod state;
pub mod store;
