//! Scheduling priority levels shared by the daemon, plugins, and clients.

use serde::{Deserialize, Serialize};

/// Totally-ordered priority levels for tasks and source jobs.
///
/// Only the relative order matters; the numeric values leave gaps so new
/// levels can be slotted in without renumbering clients.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u16", into = "u16")]
pub enum Priority {
    BackgroundScan = 10,
    OrphanScan = 15,
    ContentHash = 20,
    Low = 30,
    GuiRequestLow = 40,
    Normal = 50,
    High = 70,
    GuiRequest = 90,
    FullresRequest = 95,
    Shutdown = 999,
}

impl Priority {
    /// Human-readable level name, used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Priority::BackgroundScan => "BACKGROUND_SCAN",
            Priority::OrphanScan => "ORPHAN_SCAN",
            Priority::ContentHash => "CONTENT_HASH",
            Priority::Low => "LOW",
            Priority::GuiRequestLow => "GUI_REQUEST_LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::GuiRequest => "GUI_REQUEST",
            Priority::FullresRequest => "FULLRES_REQUEST",
            Priority::Shutdown => "SHUTDOWN",
        }
    }

    /// Levels at or below this one are gated by cache-pressure checks.
    pub fn is_background(self) -> bool {
        self <= Priority::ContentHash
    }
}

impl From<Priority> for u16 {
    fn from(priority: Priority) -> Self {
        priority as u16
    }
}

impl TryFrom<u16> for Priority {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            10 => Ok(Priority::BackgroundScan),
            15 => Ok(Priority::OrphanScan),
            20 => Ok(Priority::ContentHash),
            30 => Ok(Priority::Low),
            40 => Ok(Priority::GuiRequestLow),
            50 => Ok(Priority::Normal),
            70 => Ok(Priority::High),
            90 => Ok(Priority::GuiRequest),
            95 => Ok(Priority::FullresRequest),
            999 => Ok(Priority::Shutdown),
            other => Err(format!("unknown priority level: {other}")),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_strictly_ordered() {
        let levels = [
            Priority::BackgroundScan,
            Priority::OrphanScan,
            Priority::ContentHash,
            Priority::Low,
            Priority::GuiRequestLow,
            Priority::Normal,
            Priority::High,
            Priority::GuiRequest,
            Priority::FullresRequest,
            Priority::Shutdown,
        ];
        for pair in levels.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn wire_roundtrip_is_numeric() {
        let json = serde_json::to_string(&Priority::GuiRequest).unwrap();
        assert_eq!(json, "90");
        let back: Priority = serde_json::from_str("95").unwrap();
        assert_eq!(back, Priority::FullresRequest);
        assert!(serde_json::from_str::<Priority>("42").is_err());
    }
}
