//! Backend-side coherency with the switch cache.
//!
//! - [`coordinator`]: Open/Blocked state machine with the deferred-request queue
//! - [`store`]: authoritative in-memory key-value store and bulk loading

pub mod coordinator;
pub mod store;
