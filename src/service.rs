//! Consumer-facing lookups
//!
//! Joins financial statements (store first, shard pipeline as fallback) with
//! identity records from the search API. Every requested identifier gets an
//! explicit entry in the answer.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::api::{CompanyHit, IdentityClient};
use crate::config::RneConfig;
use crate::enricher::{BatchEnricher, EnrichmentResult, LookupStatus, SOURCE_STORE};
use crate::error::{Result, StoreError};
use crate::index::RangeIndex;
use crate::shards::ShardStore;
use crate::siren::Siren;
use crate::store::{FinancialStore, StoredBilan};

/// Answer of [`EnrichmentService::get_finances`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinancesResponse {
    pub success: bool,
    pub siren: String,
    pub bilans: Vec<StoredBilan>,
    pub count: usize,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FinancesResponse {
    fn failure(siren: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            siren: siren.to_string(),
            bilans: Vec::new(),
            count: 0,
            source: SOURCE_STORE.to_string(),
            error: Some(error.into()),
        }
    }
}

/// Identity record merged with financial statements
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedCompany {
    pub siren: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<CompanyHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_error: Option<String>,
    pub finances: EnrichmentResult,
}

pub struct EnrichmentService {
    store: Arc<FinancialStore>,
    enricher: Option<Arc<BatchEnricher>>,
    identity: Option<Arc<IdentityClient>>,
}

impl EnrichmentService {
    pub fn new(store: Arc<FinancialStore>) -> Self {
        Self {
            store,
            enricher: None,
            identity: None,
        }
    }

    pub fn with_enricher(mut self, enricher: Arc<BatchEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn with_identity(mut self, identity: Arc<IdentityClient>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Wire every component from configuration. The shard fallback is only
    /// enabled when the range index can be loaded.
    pub async fn from_config(config: &RneConfig) -> Result<Self> {
        let mut service = Self::new(Arc::new(FinancialStore::new(&config.db_path)))
            .with_identity(Arc::new(IdentityClient::new(&config.api)?));

        match RangeIndex::load(&config.index_path).await {
            Ok(index) => {
                let shards = ShardStore::from_config(&config.shards)?;
                service = service.with_enricher(Arc::new(BatchEnricher::new(
                    Arc::new(index),
                    Arc::new(shards),
                    config.enricher.clone(),
                )));
            }
            Err(e) => warn!(error = %e, "Range index unavailable, shard fallback disabled"),
        }
        Ok(service)
    }

    pub fn store(&self) -> &FinancialStore {
        &self.store
    }

    /// Statements of one company from the store, newest first, at most `years`.
    pub async fn get_finances(&self, id: &str, years: usize) -> FinancesResponse {
        let Some(siren) = Siren::normalize(id) else {
            let input = id.trim();
            return FinancesResponse::failure(input, format!("'{}' is not a valid SIREN", input));
        };
        let siren_str = siren.to_string();

        match self.store.query(siren, years).await {
            Ok(bilans) if bilans.is_empty() => {
                FinancesResponse::failure(&siren_str, "no financial statements found")
            }
            Ok(bilans) => FinancesResponse {
                success: true,
                siren: siren_str,
                count: bilans.len(),
                bilans,
                source: SOURCE_STORE.to_string(),
                error: None,
            },
            Err(StoreError::Missing(path)) => FinancesResponse::failure(
                &siren_str,
                format!("financial database not available at {}", path.display()),
            ),
            Err(e) => {
                warn!(siren = %siren_str, error = %e, "Store query failed");
                FinancesResponse::failure(&siren_str, e.to_string())
            }
        }
    }

    /// Identity plus finances for every identifier, keyed like the batch
    /// results (normalized SIREN, or the raw input when invalid).
    pub async fn enrich_batch<S: AsRef<str>>(
        &self,
        ids: &[S],
        years: usize,
    ) -> BTreeMap<String, EnrichedCompany> {
        let mut finances: BTreeMap<String, EnrichmentResult> = BTreeMap::new();
        let mut fallback = Vec::new();

        for id in ids {
            let id = id.as_ref();
            let Some(siren) = Siren::normalize(id) else {
                let result = EnrichmentResult::invalid(id);
                finances.insert(result.siren.clone(), result);
                continue;
            };
            let key = siren.to_string();
            if finances.contains_key(&key) {
                continue;
            }

            let result = match self.store.query(siren, years).await {
                Ok(bilans) if !bilans.is_empty() => {
                    EnrichmentResult::found(siren, bilans, SOURCE_STORE)
                }
                Ok(_) => EnrichmentResult::not_found(siren, SOURCE_STORE),
                Err(e) => {
                    debug!(siren = %key, error = %e, "Store lookup unavailable");
                    EnrichmentResult::failed(siren, e.to_string(), SOURCE_STORE)
                }
            };
            if result.status != LookupStatus::Found && self.enricher.is_some() {
                fallback.push(key.clone());
            }
            finances.insert(key, result);
        }

        if let Some(enricher) = &self.enricher {
            if !fallback.is_empty() {
                let report = enricher
                    .enrich(
                        &fallback,
                        enricher.config().concurrency,
                        years,
                        |progress| {
                            debug!(
                                completed = progress.completed,
                                total = progress.total,
                                shard = progress.shard,
                                "Fallback progress"
                            )
                        },
                    )
                    .await;
                finances.extend(report.results);
            }
        }

        let identities = self.identities(finances.values()).await;

        finances
            .into_iter()
            .map(|(key, mut result)| {
                let (identity, identity_error) = match identities.get(&key) {
                    Some(Ok(hit)) => (hit.clone(), None),
                    Some(Err(e)) => (None, Some(e.clone())),
                    None => (None, None),
                };
                if result.denomination.is_none() {
                    result.denomination = identity
                        .as_ref()
                        .and_then(|hit| hit.name())
                        .map(str::to_string);
                }
                let company = EnrichedCompany {
                    siren: result.siren.clone(),
                    identity,
                    identity_error,
                    finances: result,
                };
                (key, company)
            })
            .collect()
    }

    async fn identities<'a>(
        &self,
        results: impl Iterator<Item = &'a EnrichmentResult>,
    ) -> BTreeMap<String, std::result::Result<Option<CompanyHit>, String>> {
        let Some(identity) = &self.identity else {
            return BTreeMap::new();
        };

        let sirens: Vec<Siren> = results
            .filter(|r| r.status != LookupStatus::InvalidIdentifier)
            .filter_map(|r| Siren::parse(&r.siren))
            .collect();
        let lookups = sirens.iter().map(|siren| identity.lookup(*siren));
        let answers = join_all(lookups).await;

        sirens
            .iter()
            .zip(answers)
            .map(|(siren, answer)| {
                let answer = answer.map_err(|e| {
                    warn!(siren = %siren, error = %e, "Identity lookup failed");
                    e.to_string()
                });
                (siren.to_string(), answer)
            })
            .collect()
    }
}
