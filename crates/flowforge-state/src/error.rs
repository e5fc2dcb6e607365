//! Storage error taxonomy for FlowForge state backends.

/// Errors produced by attempt stores and version registries.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("version conflict for workflow '{workflow}': {detail}")]
    VersionConflict { workflow: String, detail: String },

    #[error("corrupt record in {path} at line {line}: {detail}")]
    CorruptRecord {
        path: String,
        line: usize,
        detail: String,
    },
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::VersionConflict {
            workflow: "report_digest".to_string(),
            detail: "registry file changed underneath promotion".to_string(),
        };
        assert!(err.to_string().contains("version conflict"));
        assert!(err.to_string().contains("report_digest"));
    }

    #[test]
    fn test_corrupt_record_error_names_location() {
        let err = StorageError::CorruptRecord {
            path: "attempts.jsonl".to_string(),
            line: 7,
            detail: "expected object".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("attempts.jsonl"));
        assert!(msg.contains("line 7"));
    }
}
