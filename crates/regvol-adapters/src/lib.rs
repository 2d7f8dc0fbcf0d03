//! Regulation content sources, agency catalogs and markup extraction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use regvol_core::CfrReference;
use regvol_storage::{FetchError, HttpFetcher};
use thiserror::Error;

mod catalog;
mod markup;

pub use catalog::{
    filter_agencies, parse_catalog_json, parse_catalog_yaml, Catalog, CatalogError,
    EcfrAgencyCatalog, FileCatalog, StaticCatalog, ECFR_AGENCIES_PATH,
};
pub use markup::{
    extract_paragraphs, normalize_whitespace, snapshot_from_content, ContentParseError,
    MarkupError, MarkupKind,
};

pub const CRATE_NAME: &str = "regvol-adapters";
pub const DEFAULT_ECFR_BASE_URL: &str = "https://www.ecfr.gov";

/// Markup for one reference as published on one date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawContent {
    pub markup: String,
    pub kind: MarkupKind,
    pub source_url: String,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("response body is not valid utf-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
}

/// Historical regulation text keyed by (reference, date).
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch(&self, reference: &CfrReference, date: NaiveDate)
        -> Result<RawContent, SourceError>;
}

/// `{base}/api/versioner/v1/full/{date}/title-{n}.xml`
pub fn content_url(base_url: &str, date: NaiveDate, title: u32) -> String {
    format!(
        "{}/api/versioner/v1/full/{}/title-{}.xml",
        base_url.trim_end_matches('/'),
        date.format("%Y-%m-%d"),
        title
    )
}

/// Query parameters narrowing a title to the reference's slice; absent fields are omitted.
pub fn reference_query(reference: &CfrReference) -> Vec<(&'static str, &str)> {
    reference
        .optional_fields()
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
        .collect()
}

/// eCFR versioner client.
#[derive(Debug, Clone)]
pub struct EcfrContentSource {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl EcfrContentSource {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ContentSource for EcfrContentSource {
    async fn fetch(
        &self,
        reference: &CfrReference,
        date: NaiveDate,
    ) -> Result<RawContent, SourceError> {
        let url = content_url(&self.base_url, date, reference.title);
        let query = reference_query(reference);
        let response = self.http.fetch(&url, &query).await?;
        let kind = MarkupKind::from_content_type(response.content_type.as_deref());
        let markup = String::from_utf8(response.body)?;
        Ok(RawContent {
            markup,
            kind,
            source_url: response.final_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_url_places_date_and_title_in_path() {
        let date = NaiveDate::from_ymd_opt(2019, 8, 1).unwrap();
        assert_eq!(
            content_url("https://www.ecfr.gov/", date, 40),
            "https://www.ecfr.gov/api/versioner/v1/full/2019-08-01/title-40.xml"
        );
    }

    #[test]
    fn query_carries_only_present_locators_in_hierarchy_order() {
        let reference = CfrReference::new(40)
            .with_section("52.21")
            .with_chapter("I")
            .with_part("52");
        assert_eq!(
            reference_query(&reference),
            vec![("chapter", "I"), ("part", "52"), ("section", "52.21")]
        );
        assert!(reference_query(&CfrReference::new(3)).is_empty());
    }
}
