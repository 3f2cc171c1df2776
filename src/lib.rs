//! netcache-ctl: control plane for an in-network key-value cache.
//!
//! A programmable switch keeps a small hot subset of key-value pairs in
//! register arrays; backend servers hold the full dataset. This crate
//! allocates switch memory, speaks the fixed-width wire protocol, and keeps
//! the switch copy coherent with the backend across writes and deletes.

pub mod cache;
pub mod client;
pub mod coherency;
pub mod config;
pub mod controller;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod switch;
