use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::SchemaViolation;
use crate::extract::{ExtractedBilan, FinancialMetrics, MetricCode, MetricValue};
use crate::siren::Siren;

/// Oldest closing date kept in the store
pub const MIN_CLOSING_DATE: &str = "2019-01-01";

pub fn min_closing_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2019, 1, 1).unwrap_or_default()
}

/// Leading `YYYY-MM-DD` of a closing date (timestamps are truncated).
pub fn parse_closing_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let day = raw.get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

/// One `bilans` row. Shard-derived results use the same shape without an id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredBilan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub siren: String,
    pub date_cloture: String,
    pub date_depot: Option<String>,
    pub type_bilan: Option<String>,
    pub chiffre_affaires: Option<i64>,
    pub resultat_net: Option<i64>,
    pub resultat_exploitation: Option<i64>,
    pub total_actif: Option<i64>,
    pub capitaux_propres: Option<i64>,
    pub effectif: Option<i64>,
    pub ca_precedent: Option<i64>,
    pub rn_precedent: Option<i64>,
    pub re_precedent: Option<i64>,
    pub ta_precedent: Option<i64>,
    pub cp_precedent: Option<i64>,
    pub eff_precedent: Option<i64>,
}

impl StoredBilan {
    /// Row for a store build: valid SIREN and a closing date on or after `cutoff`.
    pub fn validate(bilan: &ExtractedBilan, cutoff: NaiveDate) -> Result<Self, SchemaViolation> {
        let siren = bilan.siren.ok_or(SchemaViolation::InvalidSiren)?;
        let closing = bilan
            .date_cloture
            .as_deref()
            .and_then(parse_closing_date)
            .ok_or(SchemaViolation::MissingClosingDate)?;
        if closing < cutoff {
            return Err(SchemaViolation::BeforeCutoff);
        }

        let mut row = Self::from_extracted(siren, bilan);
        row.date_cloture = closing.format("%Y-%m-%d").to_string();
        Ok(row)
    }

    /// Row as read from a shard, without store filtering.
    pub fn from_extracted(siren: Siren, bilan: &ExtractedBilan) -> Self {
        let mut row = Self {
            id: None,
            siren: siren.to_string(),
            date_cloture: bilan.date_cloture.clone().unwrap_or_default(),
            date_depot: bilan.date_depot.clone(),
            type_bilan: bilan.type_bilan.clone(),
            ..Self::default()
        };
        for (code, value) in bilan.metrics.iter() {
            row.set_metric(code, value);
        }
        row
    }

    pub fn metric(&self, code: MetricCode) -> MetricValue {
        let (current, prior) = match code {
            MetricCode::Turnover => (self.chiffre_affaires, self.ca_precedent),
            MetricCode::NetIncome => (self.resultat_net, self.rn_precedent),
            MetricCode::OperatingIncome => (self.resultat_exploitation, self.re_precedent),
            MetricCode::TotalAssets => (self.total_actif, self.ta_precedent),
            MetricCode::Equity => (self.capitaux_propres, self.cp_precedent),
            MetricCode::Headcount => (self.effectif, self.eff_precedent),
        };
        MetricValue { current, prior }
    }

    pub fn metrics(&self) -> FinancialMetrics {
        let mut metrics = FinancialMetrics::default();
        for code in MetricCode::ALL {
            metrics.set(code, self.metric(code));
        }
        metrics
    }

    fn set_metric(&mut self, code: MetricCode, value: MetricValue) {
        let (current, prior) = match code {
            MetricCode::Turnover => (&mut self.chiffre_affaires, &mut self.ca_precedent),
            MetricCode::NetIncome => (&mut self.resultat_net, &mut self.rn_precedent),
            MetricCode::OperatingIncome => {
                (&mut self.resultat_exploitation, &mut self.re_precedent)
            }
            MetricCode::TotalAssets => (&mut self.total_actif, &mut self.ta_precedent),
            MetricCode::Equity => (&mut self.capitaux_propres, &mut self.cp_precedent),
            MetricCode::Headcount => (&mut self.effectif, &mut self.eff_precedent),
        };
        *current = value.current;
        *prior = value.prior;
    }
}

/// Most recent closing date first; rows without a date sort last.
pub fn sort_most_recent_first(rows: &mut [StoredBilan]) {
    rows.sort_by(|a, b| b.date_cloture.cmp(&a.date_cloture));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bilan(siren: &str, date: Option<&str>) -> ExtractedBilan {
        let mut metrics = FinancialMetrics::default();
        metrics.set(
            MetricCode::Equity,
            MetricValue {
                current: Some(10),
                prior: Some(9),
            },
        );
        ExtractedBilan {
            siren: Siren::parse(siren),
            date_cloture: date.map(str::to_string),
            date_depot: None,
            type_bilan: Some("C".to_string()),
            denomination: None,
            metrics,
        }
    }

    #[test]
    fn test_cutoff_is_inclusive() {
        let cutoff = min_closing_date();
        assert_eq!(
            StoredBilan::validate(&bilan("552100554", Some("2018-12-31")), cutoff),
            Err(SchemaViolation::BeforeCutoff)
        );
        assert!(StoredBilan::validate(&bilan("552100554", Some("2019-01-01")), cutoff).is_ok());
    }

    #[test]
    fn test_schema_violations() {
        let cutoff = min_closing_date();
        assert_eq!(
            StoredBilan::validate(&bilan("55210055", Some("2020-01-01")), cutoff),
            Err(SchemaViolation::InvalidSiren)
        );
        assert_eq!(
            StoredBilan::validate(&bilan("552100554", None), cutoff),
            Err(SchemaViolation::MissingClosingDate)
        );
        assert_eq!(
            StoredBilan::validate(&bilan("552100554", Some("31/12/2020")), cutoff),
            Err(SchemaViolation::MissingClosingDate)
        );
    }

    #[test]
    fn test_timestamp_dates_are_truncated() {
        let row = StoredBilan::validate(
            &bilan("552100554", Some("2021-12-31T00:00:00")),
            min_closing_date(),
        )
        .unwrap();
        assert_eq!(row.date_cloture, "2021-12-31");
    }

    #[test]
    fn test_metric_columns() {
        let row = StoredBilan::from_extracted(
            Siren::parse("552100554").unwrap(),
            &bilan("552100554", Some("2021-12-31")),
        );
        assert_eq!(row.capitaux_propres, Some(10));
        assert_eq!(row.cp_precedent, Some(9));
        assert_eq!(row.chiffre_affaires, None);
        assert_eq!(row.metrics(), bilan("552100554", None).metrics);
    }

    #[test]
    fn test_sort_most_recent_first() {
        let mut rows: Vec<StoredBilan> = ["2020-12-31", "", "2022-12-31", "2021-06-30"]
            .into_iter()
            .map(|d| StoredBilan {
                date_cloture: d.to_string(),
                ..StoredBilan::default()
            })
            .collect();
        sort_most_recent_first(&mut rows);
        let dates: Vec<&str> = rows.iter().map(|r| r.date_cloture.as_str()).collect();
        assert_eq!(dates, vec!["2022-12-31", "2021-06-30", "2020-12-31", ""]);
    }
}
