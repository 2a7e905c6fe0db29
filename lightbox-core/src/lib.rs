//! Core of the lightbox media-processing daemon.
//!
//! The daemon keeps a content-addressed cache of thumbnails, display-sized
//! previews and metadata for large photo libraries. This crate holds the
//! pieces that do the actual work: the priority task scheduler and its
//! cooperative source jobs, the SQLite-backed metadata store, the cache
//! size manager, the per-format plugin registry, the processing pipeline
//! that ties them together, and the filesystem watcher.
//!
//! The wire protocol server lives in `lightbox-daemon`; this crate only
//! produces [`lightbox_protocol::Notification`] values into a bounded queue
//! that the daemon drains.

pub mod cache;
pub mod error;
pub mod notifications;
pub mod pipeline;
pub mod plugins;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod util;
pub mod volume;
pub mod watcher;

pub use error::{CoreError, Result};
pub use lightbox_protocol::Priority;
pub use session::ActiveSession;
