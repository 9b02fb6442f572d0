//! Hypervisor monitor SDK
//!
//! Typed surface of the hypervisor control channel as consumed by the
//! migration subsystem. The channel transport itself (socket handling,
//! command framing, event dispatch) belongs to the process driver; this
//! crate only defines the commands and data the coordinator relies on.
mod client;
pub mod dto;

pub use client::{Monitor, MonitorError};
