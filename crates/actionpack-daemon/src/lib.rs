//! Receiver daemon for action packs: peer admission, receiver
//! configuration, and the bounded TCP accept loop around
//! [`actionpack_core::PackExecutor`].

pub mod admission;
pub mod config;
pub mod events;
pub mod server;

pub use admission::PeerFilter;
pub use config::{parse_listen, ReceiverConfig};
pub use server::{PackServer, ServerLimits};
