//! Request/response models for the framed command channel.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::priority::Priority;
use crate::record::ImageRecord;

/// One entry of a `move_records` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMove {
    pub old_path: String,
    pub new_path: String,
}

/// Per-path readiness as reported by `get_previews_status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewStatus {
    pub thumbnail_ready: bool,
    #[serde(default)]
    pub thumbnail_path: Option<String>,
    pub view_image_ready: bool,
    #[serde(default)]
    pub view_image_path: Option<String>,
}

/// A framed request, dispatched on its `command` field.
///
/// Every command carries a `session_id`; commands that do not act on a
/// session accept an empty one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    GetDirectoryFiles {
        #[serde(default)]
        session_id: Option<String>,
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    RequestPreviews {
        #[serde(default)]
        session_id: Option<String>,
        image_paths: Vec<String>,
        priority: Priority,
    },
    UpdateViewport {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        paths_to_upgrade: Vec<String>,
        #[serde(default)]
        paths_to_downgrade: Vec<String>,
    },
    RequestViewImage {
        #[serde(default)]
        session_id: Option<String>,
        image_path: String,
    },
    GetPreviewsStatus {
        #[serde(default)]
        session_id: Option<String>,
        image_paths: Vec<String>,
    },
    SetRating {
        #[serde(default)]
        session_id: Option<String>,
        image_paths: Vec<String>,
        rating: i64,
    },
    GetMetadataBatch {
        #[serde(default)]
        session_id: Option<String>,
        image_paths: Vec<String>,
        #[serde(default)]
        priority: Option<Priority>,
    },
    GetFilteredFilePaths {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        text_filter: String,
        star_states: [bool; 6],
        #[serde(default)]
        tag_names: Option<Vec<String>>,
    },
    SetTags {
        #[serde(default)]
        session_id: Option<String>,
        image_paths: Vec<String>,
        tags: Vec<String>,
    },
    RemoveTags {
        #[serde(default)]
        session_id: Option<String>,
        image_paths: Vec<String>,
        tags: Vec<String>,
    },
    GetTags {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        directory: Option<String>,
    },
    GetImageTags {
        #[serde(default)]
        session_id: Option<String>,
        image_paths: Vec<String>,
    },
    MoveRecords {
        #[serde(default)]
        session_id: Option<String>,
        moves: Vec<RecordMove>,
    },
    Shutdown {
        #[serde(default)]
        session_id: Option<String>,
    },
}

impl Request {
    /// The session id supplied with the request, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Request::GetDirectoryFiles { session_id, .. }
            | Request::RequestPreviews { session_id, .. }
            | Request::UpdateViewport { session_id, .. }
            | Request::RequestViewImage { session_id, .. }
            | Request::GetPreviewsStatus { session_id, .. }
            | Request::SetRating { session_id, .. }
            | Request::GetMetadataBatch { session_id, .. }
            | Request::GetFilteredFilePaths { session_id, .. }
            | Request::SetTags { session_id, .. }
            | Request::RemoveTags { session_id, .. }
            | Request::GetTags { session_id, .. }
            | Request::GetImageTags { session_id, .. }
            | Request::MoveRecords { session_id, .. }
            | Request::Shutdown { session_id } => session_id.as_deref(),
        }
    }
}

/// `get_tags` result: tags present in the queried directory plus the global
/// set, so the GUI can offer both quick-filters and the full vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagQueryReply {
    pub directory_tags: Vec<String>,
    pub global_tags: Vec<String>,
}

/// Command-specific response payload, flattened next to `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyBody {
    DirectoryFiles {
        files: Vec<String>,
    },
    Count {
        count: usize,
    },
    ViewImage {
        view_image_path: Option<String>,
    },
    PreviewsStatus {
        statuses: HashMap<String, PreviewStatus>,
    },
    MetadataBatch {
        metadata: HashMap<String, Option<ImageRecord>>,
    },
    FilteredPaths {
        paths: Vec<String>,
    },
    Tags(TagQueryReply),
    ImageTags {
        tags: HashMap<String, Vec<String>>,
    },
    MovedCount {
        moved_count: u64,
    },
    Message {
        message: String,
    },
}

/// A framed response: `status` plus either an error message or a body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    // A flattened `None` contributes no fields.
    #[serde(flatten)]
    pub body: Option<ReplyBody>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Success,
    Error,
}

impl Reply {
    pub fn ok(body: ReplyBody) -> Self {
        Self {
            status: ReplyStatus::Success,
            message: None,
            body: Some(body),
        }
    }

    pub fn ok_message(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Success,
            message: Some(message.into()),
            body: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            message: Some(message.into()),
            body: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Success
    }
}
