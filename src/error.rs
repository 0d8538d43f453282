/// Error types for the mmdb-enrich library
use std::fmt;

/// Result type alias for enrichment operations
pub type Result<T> = std::result::Result<T, EnrichError>;

/// Main error type for enrichment operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichError {
    /// Malformed CIDR string or out-of-range prefix length
    InvalidNetwork(String),

    /// I/O errors (unreadable input, failed output write)
    Io(String),

    /// Malformed CSV structure (bad quoting, short rows, missing header)
    Csv(String),

    /// MMDB format errors (encoding limits, unreadable database bytes)
    Format(String),

    /// Internal prefix tree inconsistency. Indicates a bug, never bad input.
    TreeInvariant(String),

    /// Unrecognized dataset name
    UnknownDataset(String),
}

impl fmt::Display for EnrichError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnrichError::InvalidNetwork(msg) => write!(f, "Invalid network: {}", msg),
            EnrichError::Io(msg) => write!(f, "I/O error: {}", msg),
            EnrichError::Csv(msg) => write!(f, "CSV error: {}", msg),
            EnrichError::Format(msg) => write!(f, "Format error: {}", msg),
            EnrichError::TreeInvariant(msg) => {
                write!(f, "Prefix tree invariant violated: {}", msg)
            }
            EnrichError::UnknownDataset(name) => write!(f, "Unknown dataset: {}", name),
        }
    }
}

impl std::error::Error for EnrichError {}

impl From<std::io::Error> for EnrichError {
    fn from(err: std::io::Error) -> Self {
        EnrichError::Io(err.to_string())
    }
}

impl From<csv::Error> for EnrichError {
    fn from(err: csv::Error) -> Self {
        if err.is_io_error() {
            EnrichError::Io(err.to_string())
        } else {
            EnrichError::Csv(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_prefixes() {
        let err = EnrichError::InvalidNetwork("not-a-cidr".to_string());
        assert_eq!(err.to_string(), "Invalid network: not-a-cidr");

        let err = EnrichError::TreeInvariant("dangling node 7".to_string());
        assert!(err.to_string().starts_with("Prefix tree invariant violated"));
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.csv");
        let err: EnrichError = io.into();
        assert!(matches!(err, EnrichError::Io(ref msg) if msg.contains("missing.csv")));
    }

    #[test]
    fn test_csv_io_failure_maps_to_io() {
        let err: EnrichError = csv::Reader::from_path("/nonexistent/blocks.csv")
            .unwrap_err()
            .into();
        assert!(matches!(err, EnrichError::Io(_)));
    }
}
