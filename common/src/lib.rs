//! Shared building blocks for the capture agent and the trigger controller:
//! configuration, wire protocol, image pipeline and the broker channel.

pub mod channel;
pub mod config;
pub mod pipeline;
pub mod protocol;
