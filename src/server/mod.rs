//! Backend server and admin API.
//!
//! - [`backend`]: request semantics, store and coherency state
//! - [`udp`], [`tcp`]: the two request channels
//! - [`listener`]: binds both channels on one port
//! - [`admin`]: health, stats and metrics over HTTP

pub mod admin;
pub mod backend;
pub mod listener;
pub mod tcp;
pub mod udp;
