//! The lightbox daemon: wire-protocol server, notification fan-out and
//! process lifecycle around `lightbox-core`.

pub mod bus;
pub mod instance;
pub mod server;

pub use bus::{Listeners, spawn_bus};
pub use instance::InstanceLock;
pub use server::DaemonServer;
