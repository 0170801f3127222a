use serde::{Deserialize, Serialize};

use crate::siren::Siren;
use crate::store::StoredBilan;

/// Results served from a freshly fetched shard
pub const SOURCE_SHARD: &str = "rne_shard";
/// Identifier outside every indexed range
pub const SOURCE_INDEX: &str = "rne_index";
/// Results served from the financial store
pub const SOURCE_STORE: &str = "sqlite";
/// Rejected before any lookup
pub const SOURCE_INPUT: &str = "input";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupStatus {
    Found,
    NotFound,
    InvalidIdentifier,
    Error,
}

/// Per-identifier outcome of an enrichment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub siren: String,
    pub success: bool,
    pub status: LookupStatus,
    pub bilans: Vec<StoredBilan>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denomination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Shard the identifier was resolved against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<String>,
}

impl EnrichmentResult {
    pub fn found(siren: Siren, bilans: Vec<StoredBilan>, source: &str) -> Self {
        Self {
            siren: siren.to_string(),
            success: true,
            status: LookupStatus::Found,
            bilans,
            source: source.to_string(),
            denomination: None,
            error: None,
            shard: None,
        }
    }

    pub fn not_found(siren: Siren, source: &str) -> Self {
        Self {
            success: false,
            status: LookupStatus::NotFound,
            error: Some("no financial statements found".to_string()),
            ..Self::found(siren, Vec::new(), source)
        }
    }

    pub fn invalid(input: &str) -> Self {
        Self {
            siren: input.trim().to_string(),
            success: false,
            status: LookupStatus::InvalidIdentifier,
            bilans: Vec::new(),
            source: SOURCE_INPUT.to_string(),
            denomination: None,
            error: Some(format!("'{}' is not a valid SIREN", input.trim())),
            shard: None,
        }
    }

    pub fn failed(siren: Siren, error: impl Into<String>, source: &str) -> Self {
        Self {
            success: false,
            status: LookupStatus::Error,
            error: Some(error.into()),
            ..Self::found(siren, Vec::new(), source)
        }
    }

    pub fn with_shard(mut self, shard: impl Into<String>) -> Self {
        self.shard = Some(shard.into());
        self
    }

    pub fn with_denomination(mut self, denomination: Option<String>) -> Self {
        self.denomination = denomination;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_shape() {
        let result = EnrichmentResult::not_found(Siren::parse("005880596").unwrap(), SOURCE_INDEX);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["siren"], "005880596");
        assert_eq!(value["status"], "not_found");
        assert_eq!(value["success"], false);
        assert!(value.get("shard").is_none());
    }

    #[test]
    fn test_invalid_keeps_input() {
        let result = EnrichmentResult::invalid(" ACME ");
        assert_eq!(result.siren, "ACME");
        assert_eq!(result.status, LookupStatus::InvalidIdentifier);
        assert!(result.error.unwrap().contains("ACME"));
    }
}
