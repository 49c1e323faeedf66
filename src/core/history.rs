use crate::core::error::{NfcError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One APDU exchanged with a card
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApduRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: CommandKind,
    pub command: Vec<u8>,
    pub response: Vec<u8>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Storage card commands issued by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    GetUid,
    ReadBinary { block: u8, length: u8 },
    UpdateBinary { block: u8 },
}

impl CommandKind {
    pub fn label(&self) -> String {
        match self {
            Self::GetUid => "GET UID".to_string(),
            Self::ReadBinary { block, length } => format!("READ BINARY(block {block}, {length} bytes)"),
            Self::UpdateBinary { block } => format!("UPDATE BINARY(block {block})"),
        }
    }
}

/// Journal of every frame a reader transmitted
#[derive(Debug, Default)]
pub struct ApduHistory {
    records: Vec<ApduRecord>,
}

impl ApduHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, record: ApduRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[ApduRecord] {
        &self.records
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Export history to JSON
    pub fn export_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.records)
            .map_err(|e| NfcError::config(format!("Failed to serialize APDU history: {e}")))
    }

    /// Import history from JSON
    pub fn import_json(&mut self, json: &str) -> Result<()> {
        let imported: Vec<ApduRecord> = serde_json::from_str(json)
            .map_err(|e| NfcError::config(format!("Failed to deserialize APDU history: {e}")))?;

        self.records.extend(imported);
        Ok(())
    }

    pub fn statistics(&self) -> HistoryStatistics {
        let total_commands = self.records.len();
        let successful_commands = self.records.iter().filter(|r| r.success).count();

        let average_duration_ms = if total_commands > 0 {
            self.records.iter().map(|r| r.duration_ms).sum::<u64>() / total_commands as u64
        } else {
            0
        };

        HistoryStatistics {
            total_commands,
            successful_commands,
            failed_commands: total_commands - successful_commands,
            average_duration_ms,
        }
    }
}

/// Statistics about exchanged frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryStatistics {
    pub total_commands: usize,
    pub successful_commands: usize,
    pub failed_commands: usize,
    pub average_duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: CommandKind, success: bool, duration_ms: u64) -> ApduRecord {
        ApduRecord {
            timestamp: Utc::now(),
            kind,
            command: vec![0xFF, 0xCA, 0x00, 0x00, 0x00],
            response: if success { vec![0x04, 0x90, 0x00] } else { vec![] },
            success,
            error: (!success).then(|| "Transport error: reader removed".to_string()),
            duration_ms,
        }
    }

    #[test]
    fn test_statistics() {
        let mut history = ApduHistory::new();
        assert_eq!(history.statistics().total_commands, 0);
        assert_eq!(history.statistics().average_duration_ms, 0);

        history.record(record(CommandKind::GetUid, true, 20));
        history.record(record(CommandKind::UpdateBinary { block: 4 }, false, 30));
        history.record(record(CommandKind::ReadBinary { block: 4, length: 16 }, true, 10));

        assert_eq!(
            history.statistics(),
            HistoryStatistics {
                total_commands: 3,
                successful_commands: 2,
                failed_commands: 1,
                average_duration_ms: 20,
            }
        );

        history.clear();
        assert!(history.records().is_empty());
    }

    #[test]
    fn test_export_import() {
        let mut history = ApduHistory::new();
        history.record(record(CommandKind::ReadBinary { block: 8, length: 4 }, true, 5));
        history.record(record(CommandKind::UpdateBinary { block: 9 }, false, 7));

        let json = history.export_json().unwrap();
        assert!(json.contains("ReadBinary"));
        assert!(json.contains("UpdateBinary"));

        let mut imported = ApduHistory::new();
        imported.import_json(&json).unwrap();
        assert_eq!(imported.records().len(), 2);
        assert_eq!(
            imported.records()[0].kind,
            CommandKind::ReadBinary { block: 8, length: 4 }
        );
        assert!(!imported.records()[1].success);
    }

    #[test]
    fn test_import_invalid_json() {
        let mut history = ApduHistory::new();
        assert!(history.import_json("invalid json").is_err());
        assert!(history.import_json("{}").is_err());
        assert!(history.import_json("[{\"invalid\": \"structure\"}]").is_err());
        assert_eq!(ApduHistory::new().export_json().unwrap().trim(), "[]");
    }

    #[test]
    fn test_labels() {
        assert_eq!(CommandKind::GetUid.label(), "GET UID");
        assert_eq!(
            CommandKind::ReadBinary { block: 4, length: 16 }.label(),
            "READ BINARY(block 4, 16 bytes)"
        );
        assert_eq!(
            CommandKind::UpdateBinary { block: 5 }.label(),
            "UPDATE BINARY(block 5)"
        );
    }
}
