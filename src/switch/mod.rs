//! Switch control surface.
//!
//! - [`control`]: the injected `SwitchControlPort` RPC trait
//! - [`memory`]: in-memory switch model (tests and simulation mode)
//! - [`reset`]: periodic reset of measurement registers

pub mod control;
pub mod memory;
pub mod reset;
