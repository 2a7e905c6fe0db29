//! One-way notification stream from the daemon to registered listeners.

use serde::{Deserialize, Serialize};

/// A file entry as the GUI model consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    pub path: String,
}

impl ImageEntry {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Notification type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PreviewsReady,
    ScanProgress,
    ScanComplete,
    FilesRemoved,
    ComfyuiComplete,
}

/// Payload variants; the shape is fixed per [`NotificationKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NotificationData {
    PreviewsReady {
        image_entry: ImageEntry,
        thumbnail_path: Option<String>,
        view_image_path: Option<String>,
    },
    ScanProgress {
        path: String,
        files: Vec<ImageEntry>,
    },
    ScanComplete {
        path: String,
        file_count: usize,
        files: Vec<ImageEntry>,
    },
    FilesRemoved {
        files: Vec<String>,
    },
    Other(serde_json::Value),
}

/// A typed message enqueued by workers and drained by the notification bus.
///
/// `session_id` routes GUI-scoped notifications; session-less notifications
/// (daemon indexing, watcher cleanup) are never filtered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub data: NotificationData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Notification {
    pub fn previews_ready(
        path: impl Into<String>,
        thumbnail_path: Option<String>,
        view_image_path: Option<String>,
    ) -> Self {
        Self {
            kind: NotificationKind::PreviewsReady,
            data: NotificationData::PreviewsReady {
                image_entry: ImageEntry::new(path),
                thumbnail_path,
                view_image_path,
            },
            session_id: None,
        }
    }

    pub fn scan_progress(
        path: impl Into<String>,
        files: Vec<ImageEntry>,
        session_id: Option<String>,
    ) -> Self {
        Self {
            kind: NotificationKind::ScanProgress,
            data: NotificationData::ScanProgress {
                path: path.into(),
                files,
            },
            session_id,
        }
    }

    pub fn scan_complete(
        path: impl Into<String>,
        file_count: usize,
        session_id: Option<String>,
    ) -> Self {
        Self {
            kind: NotificationKind::ScanComplete,
            data: NotificationData::ScanComplete {
                path: path.into(),
                file_count,
                files: Vec::new(),
            },
            session_id,
        }
    }

    pub fn files_removed(files: Vec<String>) -> Self {
        Self {
            kind: NotificationKind::FilesRemoved,
            data: NotificationData::FilesRemoved { files },
            session_id: None,
        }
    }

    /// Attach a session id, consuming self.
    pub fn for_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}
