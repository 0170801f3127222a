//! Metric extraction
//!
//! Reduces a raw record to six financial metrics, each with a current-year
//! (`m1`) and prior-year (`m2`) value. Each payload encoding walks its lines
//! through [`MetricLines`]; selection and parsing are shared.

pub mod amount;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::record::{CompactLine, FlatMetrics, FullPayload, RawAmount, RawRecord, RecordPayload};
use crate::siren::Siren;

pub use amount::{parse_amount, parse_amount_str, parse_whole_units, MINOR_UNIT_THRESHOLD};

/// The six extracted liasse codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricCode {
    Turnover,
    NetIncome,
    OperatingIncome,
    TotalAssets,
    Equity,
    Headcount,
}

impl MetricCode {
    pub const ALL: [MetricCode; 6] = [
        MetricCode::Turnover,
        MetricCode::NetIncome,
        MetricCode::OperatingIncome,
        MetricCode::TotalAssets,
        MetricCode::Equity,
        MetricCode::Headcount,
    ];

    /// Code as it appears on the filed statement
    pub fn liasse_code(self) -> &'static str {
        match self {
            Self::Turnover => "FA",
            Self::NetIncome => "HN",
            Self::OperatingIncome => "GC",
            Self::TotalAssets => "BJ",
            Self::Equity => "DL",
            Self::Headcount => "HY",
        }
    }

    pub fn from_liasse_code(code: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|metric| metric.liasse_code() == code)
    }

    /// Store column holding the current-year value
    pub fn current_column(self) -> &'static str {
        match self {
            Self::Turnover => "chiffre_affaires",
            Self::NetIncome => "resultat_net",
            Self::OperatingIncome => "resultat_exploitation",
            Self::TotalAssets => "total_actif",
            Self::Equity => "capitaux_propres",
            Self::Headcount => "effectif",
        }
    }

    /// Store column holding the prior-year value
    pub fn prior_column(self) -> &'static str {
        match self {
            Self::Turnover => "ca_precedent",
            Self::NetIncome => "rn_precedent",
            Self::OperatingIncome => "re_precedent",
            Self::TotalAssets => "ta_precedent",
            Self::Equity => "cp_precedent",
            Self::Headcount => "eff_precedent",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for MetricCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Turnover => "turnover",
            Self::NetIncome => "net_income",
            Self::OperatingIncome => "operating_income",
            Self::TotalAssets => "total_assets",
            Self::Equity => "equity",
            Self::Headcount => "headcount",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricValue {
    pub current: Option<i64>,
    pub prior: Option<i64>,
}

/// The fixed six-metric schema
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinancialMetrics([MetricValue; 6]);

impl FinancialMetrics {
    pub fn get(&self, code: MetricCode) -> MetricValue {
        self.0[code.slot()]
    }

    pub fn set(&mut self, code: MetricCode, value: MetricValue) {
        self.0[code.slot()] = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = (MetricCode, MetricValue)> + '_ {
        MetricCode::ALL.into_iter().map(|code| (code, self.get(code)))
    }

    pub fn is_empty(&self) -> bool {
        self.0
            .iter()
            .all(|v| v.current.is_none() && v.prior.is_none())
    }
}

/// One accounting line as seen by the extractor
#[derive(Debug, Clone, Copy)]
pub struct LineRef<'a> {
    pub code: &'a str,
    pub m1: Option<&'a RawAmount>,
    pub m2: Option<&'a RawAmount>,
}

/// Line-walking strategy for one payload encoding
pub trait MetricLines {
    /// Every accounting line, in source order
    fn lines(&self) -> Box<dyn Iterator<Item = LineRef<'_>> + '_>;
}

impl MetricLines for FullPayload {
    fn lines(&self) -> Box<dyn Iterator<Item = LineRef<'_>> + '_> {
        Box::new(
            self.pages()
                .iter()
                .flat_map(|page| page.liasses.iter())
                .map(|line| LineRef {
                    code: &line.code,
                    m1: line.m1.as_ref(),
                    m2: line.m2.as_ref(),
                }),
        )
    }
}

impl MetricLines for BTreeMap<String, CompactLine> {
    fn lines(&self) -> Box<dyn Iterator<Item = LineRef<'_>> + '_> {
        Box::new(self.iter().map(|(code, line)| LineRef {
            code,
            m1: line.m1.as_ref(),
            m2: line.m2.as_ref(),
        }))
    }
}

struct NoLines;

impl MetricLines for NoLines {
    fn lines(&self) -> Box<dyn Iterator<Item = LineRef<'_>> + '_> {
        Box::new(std::iter::empty())
    }
}

impl RecordPayload {
    pub fn metric_lines(&self) -> &dyn MetricLines {
        match self {
            Self::Compact { metrics } => metrics,
            Self::Full(full) => full,
            Self::Empty {} => &NoLines,
        }
    }
}

/// Raw source values chosen for one metric
#[derive(Debug, Clone, Copy, Default)]
struct Selected<'a> {
    m1: Option<&'a RawAmount>,
    m2: Option<&'a RawAmount>,
}

/// Last line with a parseable value wins, independently for m1 and m2.
fn select(lines: &dyn MetricLines) -> [Selected<'_>; 6] {
    let mut selected = [Selected::default(); 6];
    for line in lines.lines() {
        let Some(code) = MetricCode::from_liasse_code(line.code.trim()) else {
            continue;
        };
        let slot = &mut selected[code.slot()];
        if let Some(m1) = line.m1.filter(|raw| parse_amount(raw).is_some()) {
            slot.m1 = Some(m1);
        }
        if let Some(m2) = line.m2.filter(|raw| parse_amount(raw).is_some()) {
            slot.m2 = Some(m2);
        }
    }
    selected
}

pub fn extract_metrics(lines: &dyn MetricLines) -> FinancialMetrics {
    let mut metrics = FinancialMetrics::default();
    for (code, chosen) in MetricCode::ALL.into_iter().zip(select(lines)) {
        metrics.set(
            code,
            MetricValue {
                current: chosen.m1.and_then(parse_amount),
                prior: chosen.m2.and_then(parse_amount),
            },
        );
    }
    metrics
}

/// Current and prior values a flat row carries for `code`
fn flat_values(flat: &FlatMetrics, code: MetricCode) -> [Option<&RawAmount>; 2] {
    let (current, prior) = match code {
        MetricCode::Turnover => (&flat.chiffre_affaires, &flat.ca_precedent),
        MetricCode::NetIncome => (&flat.resultat_net, &flat.rn_precedent),
        MetricCode::OperatingIncome => (&flat.resultat_exploitation, &flat.re_precedent),
        MetricCode::TotalAssets => (&flat.total_actif, &flat.ta_precedent),
        MetricCode::Equity => (&flat.capitaux_propres, &flat.cp_precedent),
        MetricCode::Headcount => (&flat.effectif, &flat.eff_precedent),
    };
    [current.as_ref(), prior.as_ref()]
}

/// Extract the six metrics from a record, whatever its encoding.
///
/// Flat columns only fill values the payload leaves empty.
pub fn extract(record: &RawRecord) -> FinancialMetrics {
    let mut metrics = extract_metrics(record.payload.metric_lines());
    if record.flat.is_empty() {
        return metrics;
    }
    for code in MetricCode::ALL {
        let [current, prior] = flat_values(&record.flat, code);
        let mut value = metrics.get(code);
        value.current = value.current.or_else(|| current.and_then(parse_whole_units));
        value.prior = value.prior.or_else(|| prior.and_then(parse_whole_units));
        metrics.set(code, value);
    }
    metrics
}

/// A record reduced to identity fields plus metrics
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedBilan {
    pub siren: Option<Siren>,
    pub date_cloture: Option<String>,
    pub date_depot: Option<String>,
    pub type_bilan: Option<String>,
    pub denomination: Option<String>,
    pub metrics: FinancialMetrics,
}

pub fn extract_bilan(record: &RawRecord) -> ExtractedBilan {
    ExtractedBilan {
        siren: record.siren(),
        date_cloture: record.closing_date().map(str::to_string),
        date_depot: record.date_depot.clone(),
        type_bilan: record.type_bilan.clone(),
        denomination: record.denomination.clone(),
        metrics: extract(record),
    }
}

/// Convert a record to the compact encoding.
///
/// Only the six metric codes survive, each keeping the raw text of its
/// selected lines; the closing date is lifted to the top level.
pub fn to_compact(record: &RawRecord) -> RawRecord {
    let metrics: BTreeMap<String, CompactLine> = MetricCode::ALL
        .into_iter()
        .zip(select(record.payload.metric_lines()))
        .filter(|(_, chosen)| chosen.m1.is_some() || chosen.m2.is_some())
        .map(|(code, chosen)| {
            (
                code.liasse_code().to_string(),
                CompactLine {
                    m1: chosen.m1.cloned(),
                    m2: chosen.m2.cloned(),
                },
            )
        })
        .collect();

    RawRecord {
        siren: record.siren.clone(),
        date_cloture: record.closing_date().map(str::to_string),
        date_depot: record.date_depot.clone(),
        type_bilan: record.type_bilan.clone(),
        denomination: record.denomination.clone(),
        payload: RecordPayload::Compact { metrics },
        flat: record.flat.clone(),
    }
}
