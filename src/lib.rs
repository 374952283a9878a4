#![forbid(unsafe_code)]

// castroom - control plane for multi-room one-to-many screen sharing and chat.

pub mod bus;
pub mod chat;
pub mod config;
pub mod media;
pub mod metrics;
pub mod presence;
pub mod registry;
pub mod signaling;
