//! Identity-search API response types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `GET /search` response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub results: Vec<CompanyHit>,
    #[serde(default)]
    pub total_results: u64,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default)]
    pub per_page: u32,
}

/// One company in a search response. Fields not modelled here are kept in
/// `extra` and passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyHit {
    pub siren: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nom_complet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nom_raison_sociale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etat_administratif: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_creation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub siege: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CompanyHit {
    /// Best display name
    pub fn name(&self) -> Option<&str> {
        self.nom_complet
            .as_deref()
            .or(self.nom_raison_sociale.as_deref())
    }
}
