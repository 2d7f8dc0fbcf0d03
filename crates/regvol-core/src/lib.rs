//! Core domain model, feature extractors and the quarterly snapshot axis for regvol.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "regvol-core";

/// Months sampled on every year of the backfill grid. Day is always the 1st.
pub const QUARTER_MONTHS: [u32; 4] = [2, 5, 8, 11];
pub const DEFAULT_MIN_YEAR: i32 = 2018;
pub const DEFAULT_TERMINAL_YEAR: i32 = 2025;

/// Name under which [`WordCount`] reports its value.
pub const WORD_COUNT: &str = "word_count";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("agency name must not be empty")]
    EmptyAgencyName,
    #[error("cfr title must be a positive integer")]
    InvalidTitle,
    #[error("cfr reference field `{field}` is present but blank")]
    BlankField { field: &'static str },
    #[error("year range {min_year}..={terminal_year} is empty")]
    EmptyYearRange { min_year: i32, terminal_year: i32 },
    #[error("word count must not be negative, got {0}")]
    NegativeWordCount(i64),
    #[error(
        "regulation row for `{agency_name}` on {date} does not belong to unit `{expected_agency}` on {expected_date}"
    )]
    ForeignRegulation {
        agency_name: String,
        date: NaiveDate,
        expected_agency: String,
        expected_date: NaiveDate,
    },
    #[error("agency word count {agency_total} differs from regulation sum {regulation_sum}")]
    SumMismatch {
        agency_total: i64,
        regulation_sum: i64,
    },
}

/// Structured locator for a slice of the Code of Federal Regulations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CfrReference {
    pub title: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subchapter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subpart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appendix: Option<String>,
}

impl CfrReference {
    pub fn new(title: u32) -> Self {
        Self {
            title,
            ..Default::default()
        }
    }

    pub fn with_chapter(mut self, chapter: impl Into<String>) -> Self {
        self.chapter = Some(chapter.into());
        self
    }

    pub fn with_subchapter(mut self, subchapter: impl Into<String>) -> Self {
        self.subchapter = Some(subchapter.into());
        self
    }

    pub fn with_part(mut self, part: impl Into<String>) -> Self {
        self.part = Some(part.into());
        self
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    /// Optional locator fields in hierarchy order, paired with their wire names.
    pub fn optional_fields(&self) -> [(&'static str, Option<&str>); 7] {
        [
            ("subtitle", self.subtitle.as_deref()),
            ("chapter", self.chapter.as_deref()),
            ("subchapter", self.subchapter.as_deref()),
            ("part", self.part.as_deref()),
            ("subpart", self.subpart.as_deref()),
            ("section", self.section.as_deref()),
            ("appendix", self.appendix.as_deref()),
        ]
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title == 0 {
            return Err(ValidationError::InvalidTitle);
        }
        for (field, value) in self.optional_fields() {
            if value.is_some_and(|v| v.trim().is_empty()) {
                return Err(ValidationError::BlankField { field });
            }
        }
        Ok(())
    }
}

impl fmt::Display for CfrReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "title {}", self.title)?;
        for (field, value) in self.optional_fields() {
            if let Some(value) = value {
                write!(f, " {field} {value}")?;
            }
        }
        Ok(())
    }
}

/// A regulatory body and the CFR slices it is responsible for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agency {
    pub name: String,
    pub short_name: Option<String>,
    pub cfr_references: Vec<CfrReference>,
}

impl Agency {
    pub fn new(
        name: impl Into<String>,
        short_name: Option<String>,
        cfr_references: Vec<CfrReference>,
    ) -> Result<Self, ValidationError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(ValidationError::EmptyAgencyName);
        }
        for reference in &cfr_references {
            reference.validate()?;
        }
        let short_name = short_name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Ok(Self {
            name,
            short_name,
            cfr_references,
        })
    }

    /// Filesystem-safe identifier derived from the agency name.
    pub fn slug(&self) -> String {
        slugify(&self.name)
    }

    pub fn matches(&self, needle: &str) -> bool {
        self.name.eq_ignore_ascii_case(needle)
            || self
                .short_name
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case(needle))
    }
}

pub fn slugify(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// One reference's normalized paragraphs as of one snapshot date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegulationSnapshot {
    pub reference: CfrReference,
    pub date: NaiveDate,
    pub paragraphs: Vec<String>,
}

pub trait FeatureExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Paragraphs are already whitespace-normalized and non-empty.
    fn extract(&self, paragraphs: &[String]) -> i64;
}

/// Space-delimited token count summed over all paragraphs.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordCount;

impl WordCount {
    fn paragraph_word_count(paragraph: &str) -> i64 {
        paragraph.split(' ').filter(|t| !t.is_empty()).count() as i64
    }
}

impl FeatureExtractor for WordCount {
    fn name(&self) -> &'static str {
        WORD_COUNT
    }

    fn extract(&self, paragraphs: &[String]) -> i64 {
        paragraphs
            .iter()
            .map(|p| Self::paragraph_word_count(p))
            .sum()
    }
}

/// Named scalar features for one regulation or, after summing, one agency.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeatureValues(BTreeMap<String, i64>);

impl FeatureValues {
    pub fn insert(&mut self, name: impl Into<String>, value: i64) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.0.get(name).copied()
    }

    pub fn word_count(&self) -> i64 {
        self.get(WORD_COUNT).unwrap_or(0)
    }

    pub fn accumulate(&mut self, other: &FeatureValues) {
        for (name, value) in &other.0 {
            *self.0.entry(name.clone()).or_default() += value;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl<'a> std::iter::Sum<&'a FeatureValues> for FeatureValues {
    fn sum<I: Iterator<Item = &'a FeatureValues>>(iter: I) -> Self {
        let mut total = FeatureValues::default();
        for values in iter {
            total.accumulate(values);
        }
        total
    }
}

/// Independent extractors run over the same paragraph sequence.
#[derive(Clone)]
pub struct FeatureSet {
    extractors: Vec<Arc<dyn FeatureExtractor>>,
}

impl Default for FeatureSet {
    fn default() -> Self {
        Self {
            extractors: vec![Arc::new(WordCount)],
        }
    }
}

impl fmt::Debug for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl FeatureSet {
    pub fn empty() -> Self {
        Self {
            extractors: Vec::new(),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn FeatureExtractor>) -> Self {
        self.extractors.push(extractor);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.extractors.iter().map(|e| e.name()).collect()
    }

    pub fn evaluate(&self, paragraphs: &[String]) -> FeatureValues {
        let mut values = FeatureValues::default();
        for extractor in &self.extractors {
            values.insert(extractor.name(), extractor.extract(paragraphs));
        }
        values
    }
}

/// Persisted fact row: one reference of one agency on one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegulationOnDate {
    pub date: NaiveDate,
    pub reference: CfrReference,
    pub agency_name: String,
    pub word_count: i64,
}

impl RegulationOnDate {
    pub fn new(
        date: NaiveDate,
        reference: CfrReference,
        agency_name: impl Into<String>,
        word_count: i64,
    ) -> Result<Self, ValidationError> {
        reference.validate()?;
        let agency_name = agency_name.into();
        if agency_name.trim().is_empty() {
            return Err(ValidationError::EmptyAgencyName);
        }
        if word_count < 0 {
            return Err(ValidationError::NegativeWordCount(word_count));
        }
        Ok(Self {
            date,
            reference,
            agency_name,
            word_count,
        })
    }
}

/// Persisted aggregate row: one agency on one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgencyOnDate {
    pub date: NaiveDate,
    pub name: String,
    pub short_name: Option<String>,
    pub word_count: i64,
}

impl AgencyOnDate {
    pub fn new(date: NaiveDate, agency: &Agency, word_count: i64) -> Result<Self, ValidationError> {
        if word_count < 0 {
            return Err(ValidationError::NegativeWordCount(word_count));
        }
        Ok(Self {
            date,
            name: agency.name.clone(),
            short_name: agency.short_name.clone(),
            word_count,
        })
    }
}

/// Everything a successful unit writes, checked to satisfy the aggregation invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgencyBatch {
    agency: AgencyOnDate,
    regulations: Vec<RegulationOnDate>,
}

impl AgencyBatch {
    pub fn new(
        agency: AgencyOnDate,
        regulations: Vec<RegulationOnDate>,
    ) -> Result<Self, ValidationError> {
        for row in &regulations {
            if row.date != agency.date || row.agency_name != agency.name {
                return Err(ValidationError::ForeignRegulation {
                    agency_name: row.agency_name.clone(),
                    date: row.date,
                    expected_agency: agency.name.clone(),
                    expected_date: agency.date,
                });
            }
        }
        let regulation_sum: i64 = regulations.iter().map(|r| r.word_count).sum();
        if regulation_sum != agency.word_count {
            return Err(ValidationError::SumMismatch {
                agency_total: agency.word_count,
                regulation_sum,
            });
        }
        Ok(Self {
            agency,
            regulations,
        })
    }

    pub fn date(&self) -> NaiveDate {
        self.agency.date
    }

    pub fn agency(&self) -> &AgencyOnDate {
        &self.agency
    }

    pub fn regulations(&self) -> &[RegulationOnDate] {
        &self.regulations
    }
}

/// Durable record of a failed (date, agency) unit, kept for reprocessing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub date: NaiveDate,
    pub agency_name: String,
    pub agency_short_name: Option<String>,
    /// JSON array of the agency's full reference list at failure time.
    pub references: String,
    pub failure: String,
}

/// `err` followed by every source in its chain whose text the message does not already include.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut next = err.source();
    while let Some(cause) = next {
        let part = cause.to_string();
        if !part.is_empty() && !text.contains(&part) {
            text.push_str(": ");
            text.push_str(&part);
        }
        next = cause.source();
    }
    text
}

impl DeadLetter {
    pub fn for_agency(
        date: NaiveDate,
        agency: &Agency,
        failure: impl fmt::Display,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            date,
            agency_name: agency.name.clone(),
            agency_short_name: agency.short_name.clone(),
            references: serde_json::to_string(&agency.cfr_references)?,
            failure: failure.to_string(),
        })
    }

    pub fn decode_references(&self) -> Result<Vec<CfrReference>, serde_json::Error> {
        serde_json::from_str(&self.references)
    }

    /// Rebuild the agency scope recorded at failure time.
    pub fn to_agency(&self) -> Result<Agency, serde_json::Error> {
        Ok(Agency {
            name: self.agency_name.clone(),
            short_name: self.agency_short_name.clone(),
            cfr_references: self.decode_references()?,
        })
    }
}

/// Quarterly snapshot grid between two inclusive years.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateAxis {
    pub min_year: i32,
    pub terminal_year: i32,
}

impl Default for DateAxis {
    fn default() -> Self {
        Self {
            min_year: DEFAULT_MIN_YEAR,
            terminal_year: DEFAULT_TERMINAL_YEAR,
        }
    }
}

impl DateAxis {
    pub fn new(min_year: i32, terminal_year: i32) -> Result<Self, ValidationError> {
        if min_year > terminal_year {
            return Err(ValidationError::EmptyYearRange {
                min_year,
                terminal_year,
            });
        }
        Ok(Self {
            min_year,
            terminal_year,
        })
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        generate_axis_through(self.min_year, self.terminal_year)
    }

    /// Grid dates on or before `last`, for runs that must not query the future.
    pub fn dates_until(&self, last: NaiveDate) -> Vec<NaiveDate> {
        self.dates().into_iter().filter(|d| *d <= last).collect()
    }

    pub fn first(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.min_year, QUARTER_MONTHS[0], 1)
    }

    pub fn last(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.terminal_year, QUARTER_MONTHS[3], 1)
    }
}

/// Quarterly dates from `min_year` through [`DEFAULT_TERMINAL_YEAR`].
pub fn generate_axis(min_year: i32) -> Vec<NaiveDate> {
    generate_axis_through(min_year, DEFAULT_TERMINAL_YEAR)
}

pub fn generate_axis_through(min_year: i32, terminal_year: i32) -> Vec<NaiveDate> {
    (min_year..=terminal_year)
        .flat_map(|year| {
            QUARTER_MONTHS
                .iter()
                .filter_map(move |month| NaiveDate::from_ymd_opt(year, *month, 1))
        })
        .collect()
}

/// Default "old" side of the cross-agency summary.
pub fn default_summary_old_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(DEFAULT_MIN_YEAR, QUARTER_MONTHS[0], 1).unwrap_or(NaiveDate::MIN)
}

/// Default "new" side of the cross-agency summary.
pub fn default_summary_new_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(DEFAULT_TERMINAL_YEAR, QUARTER_MONTHS[0], 1).unwrap_or(NaiveDate::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgencySummary {
    pub name: String,
    pub short_name: Option<String>,
    pub new_word_count: i64,
    pub old_word_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub word_count: i64,
}

/// Outer-join two snapshots by agency name; a missing side counts as zero.
///
/// Ordered by `new_word_count` descending, ties broken by name.
pub fn summarize(old: &[AgencyOnDate], new: &[AgencyOnDate]) -> Vec<AgencySummary> {
    let mut merged: BTreeMap<&str, AgencySummary> = BTreeMap::new();
    for row in new {
        merged.insert(
            row.name.as_str(),
            AgencySummary {
                name: row.name.clone(),
                short_name: row.short_name.clone(),
                new_word_count: row.word_count,
                old_word_count: 0,
            },
        );
    }
    for row in old {
        let entry = merged
            .entry(row.name.as_str())
            .or_insert_with(|| AgencySummary {
                name: row.name.clone(),
                short_name: None,
                new_word_count: 0,
                old_word_count: 0,
            });
        entry.old_word_count = row.word_count;
        if entry.short_name.is_none() {
            entry.short_name = row.short_name.clone();
        }
    }
    let mut rows = merged.into_values().collect::<Vec<_>>();
    rows.sort_by(|a, b| {
        b.new_word_count
            .cmp(&a.new_word_count)
            .then_with(|| a.name.cmp(&b.name))
    });
    rows
}
