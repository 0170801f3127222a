//! Raw RNE annual-accounts records and shard documents
//!
//! A record's metric payload comes in one of two encodings:
//! - **full**: the registry's filed statement, `bilanSaisi.bilan.detail.pages[].liasses[]`
//!   (or a detached top-level `pages` array)
//! - **compact**: `metrics{code: {m1, m2}}`, holding only the extracted codes
//!
//! The encoding is recognised by its discriminant field (`metrics` vs
//! `bilanSaisi`/`pages`). Rows exported by earlier tooling may also carry
//! already-extracted values as top-level store columns ([`FlatMetrics`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ShardError;
use crate::siren::Siren;

/// A raw amount as found in the source: usually a zero-padded digit string,
/// occasionally a JSON number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawAmount {
    Integer(i64),
    Decimal(f64),
    Text(String),
}

/// One accounting line of a filed statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiasseLine {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub m1: Option<RawAmount>,
    #[serde(default)]
    pub m2: Option<RawAmount>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    #[serde(default, alias = "lignes", alias = "lines")]
    pub liasses: Vec<LiasseLine>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identite {
    #[serde(
        rename = "dateClotureExercice",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub date_cloture_exercice: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detail {
    #[serde(default)]
    pub pages: Vec<Page>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bilan {
    #[serde(default)]
    pub identite: Identite,
    #[serde(default)]
    pub detail: Detail,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BilanSaisi {
    #[serde(default)]
    pub bilan: Bilan,
}

/// One entry of a compact `metrics` map
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactLine {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m1: Option<RawAmount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m2: Option<RawAmount>,
}

/// Legacy full encoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FullPayload {
    Filed {
        #[serde(rename = "bilanSaisi")]
        bilan_saisi: BilanSaisi,
    },
    Detached {
        pages: Vec<Page>,
    },
}

impl FullPayload {
    pub fn pages(&self) -> &[Page] {
        match self {
            Self::Filed { bilan_saisi } => &bilan_saisi.bilan.detail.pages,
            Self::Detached { pages } => pages,
        }
    }
}

/// Metric payload of a record, discriminated by field presence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordPayload {
    Compact {
        metrics: BTreeMap<String, CompactLine>,
    },
    Full(FullPayload),
    Empty {},
}

impl Default for RecordPayload {
    fn default() -> Self {
        Self::Empty {}
    }
}

/// Already-extracted values in whole units, named like the store columns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chiffre_affaires: Option<RawAmount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resultat_net: Option<RawAmount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resultat_exploitation: Option<RawAmount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_actif: Option<RawAmount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capitaux_propres: Option<RawAmount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effectif: Option<RawAmount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_precedent: Option<RawAmount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rn_precedent: Option<RawAmount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub re_precedent: Option<RawAmount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ta_precedent: Option<RawAmount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cp_precedent: Option<RawAmount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eff_precedent: Option<RawAmount>,
}

impl FlatMetrics {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One company's annual-accounts record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub siren: Option<String>,
    #[serde(
        rename = "dateCloture",
        alias = "date_cloture",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub date_cloture: Option<String>,
    #[serde(
        rename = "dateDepot",
        alias = "date_depot",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub date_depot: Option<String>,
    #[serde(
        rename = "typeBilan",
        alias = "type_bilan",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub type_bilan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denomination: Option<String>,
    #[serde(flatten)]
    pub payload: RecordPayload,
    #[serde(flatten)]
    pub flat: FlatMetrics,
}

impl RawRecord {
    /// Strictly parsed identifier, if the record carries a valid one
    pub fn siren(&self) -> Option<Siren> {
        self.siren.as_deref().map(str::trim).and_then(Siren::parse)
    }

    /// Closing date: the top-level field wins over the filed statement's identity block.
    pub fn closing_date(&self) -> Option<&str> {
        let top = self
            .date_cloture
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        top.or_else(|| match &self.payload {
            RecordPayload::Full(FullPayload::Filed { bilan_saisi }) => bilan_saisi
                .bilan
                .identite
                .date_cloture_exercice
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty()),
            _ => None,
        })
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self.payload, RecordPayload::Full(_))
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Loose {
        Text(String),
        Number(u64),
    }

    Ok(Option::<Loose>::deserialize(deserializer)?.map(|v| match v {
        Loose::Text(s) => s,
        Loose::Number(n) => format!("{:09}", n),
    }))
}

/// Parsed content of one shard file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Shard {
    pub name: String,
    pub records: Vec<RawRecord>,
}

#[derive(Deserialize)]
struct WrappedShard {
    #[serde(alias = "results")]
    bilans: Vec<RawRecord>,
}

impl Shard {
    /// Parse a shard document: a bare JSON array, or an object wrapping the
    /// array under `bilans`/`results`.
    pub fn parse(name: &str, bytes: &[u8]) -> Result<Self, ShardError> {
        let wrapped = bytes
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .is_some_and(|b| *b == b'{');

        let records = if wrapped {
            serde_json::from_slice::<WrappedShard>(bytes).map(|w| w.bilans)
        } else {
            serde_json::from_slice::<Vec<RawRecord>>(bytes)
        }
        .map_err(|source| ShardError::Parse {
            shard: name.to_string(),
            source,
        })?;

        Ok(Self {
            name: name.to_string(),
            records,
        })
    }

    /// Serialize as a bare JSON array (the cache format)
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.records)
    }

    pub fn has_legacy_records(&self) -> bool {
        self.records.iter().any(RawRecord::is_legacy)
    }

    /// Records belonging to one company, in file order
    pub fn records_for(&self, siren: Siren) -> impl Iterator<Item = &RawRecord> {
        self.records
            .iter()
            .filter(move |record| record.siren() == Some(siren))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "siren": "005880596",
        "denomination": "GEDIMO HOLDING",
        "dateDepot": "2022-07-12",
        "typeBilan": "C",
        "bilanSaisi": {
            "bilan": {
                "identite": { "dateClotureExercice": "2021-12-31" },
                "detail": {
                    "pages": [
                        { "numero": 1, "liasses": [ { "code": "FA", "m1": "000000000123456", "m2": "000000000100000" } ] }
                    ]
                }
            }
        }
    }"#;

    const COMPACT: &str = r#"{
        "siren": "005880596",
        "dateCloture": "2021-12-31",
        "metrics": { "FA": { "m1": "000000000123456", "m2": 100000 } }
    }"#;

    #[test]
    fn test_full_record_is_recognised() {
        let record: RawRecord = serde_json::from_str(FULL).unwrap();
        assert!(record.is_legacy());
        assert_eq!(record.closing_date(), Some("2021-12-31"));
        assert_eq!(record.denomination.as_deref(), Some("GEDIMO HOLDING"));
        match &record.payload {
            RecordPayload::Full(full) => {
                assert_eq!(full.pages().len(), 1);
                assert_eq!(full.pages()[0].liasses[0].code, "FA");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_compact_record_is_recognised() {
        let record: RawRecord = serde_json::from_str(COMPACT).unwrap();
        assert!(!record.is_legacy());
        match &record.payload {
            RecordPayload::Compact { metrics } => {
                assert_eq!(metrics["FA"].m2, Some(RawAmount::Integer(100_000)));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_detached_pages_with_lignes_alias() {
        let record: RawRecord = serde_json::from_str(
            r#"{"siren": "123456789", "pages": [{"lignes": [{"code": "HN", "m1": "12"}]}]}"#,
        )
        .unwrap();
        match &record.payload {
            RecordPayload::Full(FullPayload::Detached { pages }) => {
                assert_eq!(pages[0].liasses[0].code, "HN");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_record_without_payload() {
        let record: RawRecord =
            serde_json::from_str(r#"{"siren": 5880596, "dateCloture": "2020-06-30"}"#).unwrap();
        assert_eq!(record.payload, RecordPayload::Empty {});
        assert_eq!(record.siren().map(|s| s.to_string()).as_deref(), Some("005880596"));
    }

    #[test]
    fn test_flat_columns_beside_payload() {
        let record: RawRecord = serde_json::from_str(
            r#"{"siren": "552100554", "dateCloture": "2022-12-31",
                "metrics": {"FA": {"m1": "10"}},
                "chiffre_affaires": 99, "ca_precedent": "1 200"}"#,
        )
        .unwrap();
        assert!(matches!(record.payload, RecordPayload::Compact { .. }));
        assert_eq!(record.flat.chiffre_affaires, Some(RawAmount::Integer(99)));
        assert_eq!(
            record.flat.ca_precedent,
            Some(RawAmount::Text("1 200".to_string()))
        );

        let flat_only: RawRecord = serde_json::from_str(
            r#"{"siren": "552100554", "dateCloture": "2022-12-31", "effectif": 12}"#,
        )
        .unwrap();
        assert_eq!(flat_only.payload, RecordPayload::Empty {});
        assert!(!flat_only.flat.is_empty());
        assert!(!flat_only.is_legacy());

        let value = serde_json::to_value(&flat_only).unwrap();
        assert_eq!(value["effectif"], 12);
        assert!(value.get("chiffre_affaires").is_none());
    }

    #[test]
    fn test_top_level_date_wins() {
        let mut record: RawRecord = serde_json::from_str(FULL).unwrap();
        record.date_cloture = Some("2021-06-30".to_string());
        assert_eq!(record.closing_date(), Some("2021-06-30"));
    }

    #[test]
    fn test_compact_serializes_flat() {
        let record: RawRecord = serde_json::from_str(COMPACT).unwrap();
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("metrics").is_some());
        assert!(value.get("payload").is_none());
        let back: RawRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_shard_parse_array_and_wrapped() {
        let array = format!("[{},{}]", FULL, COMPACT);
        let shard = Shard::parse("stock_000001.json", array.as_bytes()).unwrap();
        assert_eq!(shard.records.len(), 2);
        assert!(shard.has_legacy_records());

        let wrapped = format!("{{\"bilans\": [{}]}}", COMPACT);
        let shard = Shard::parse("wrapped.json", wrapped.as_bytes()).unwrap();
        assert_eq!(shard.records.len(), 1);
        assert!(!shard.has_legacy_records());
    }

    #[test]
    fn test_shard_parse_error_names_shard() {
        let err = Shard::parse("broken.json", b"[{\"siren\": ").unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }

    #[test]
    fn test_records_for_filters_by_siren() {
        let other = COMPACT.replace("005880596", "552100554");
        let array = format!("[{},{},{}]", FULL, other, COMPACT);
        let shard = Shard::parse("s", array.as_bytes()).unwrap();
        let siren = Siren::parse("005880596").unwrap();
        assert_eq!(shard.records_for(siren).count(), 2);
    }
}
