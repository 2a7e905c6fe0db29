//! Wire protocol shared by the lightbox daemon and its GUI clients.
//!
//! Everything that crosses the Unix socket lives here: the frame codec
//! ([`frame`]), the request/response models ([`message`]), the one-way
//! notification stream ([`notification`]), and the scheduling vocabulary
//! ([`priority`]) that clients use to hint urgency.

pub mod frame;
pub mod message;
pub mod notification;
pub mod priority;
pub mod record;

pub use frame::{
    Frame, FrameError, MAX_BINARY_FRAME_SIZE, MAX_JSON_FRAME_SIZE, read_frame,
    write_frame,
};
pub use message::{
    PreviewStatus, RecordMove, Reply, ReplyBody, Request, TagQueryReply,
};
pub use notification::{ImageEntry, Notification, NotificationKind};
pub use priority::Priority;
pub use record::ImageRecord;

/// First message a listener connection sends to upgrade itself into the
/// notification fan-out set.
pub const REGISTER_NOTIFIER: &str = "register_notifier";
