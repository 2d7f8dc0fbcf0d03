//! Agency catalogs: the eCFR admin endpoint, a local YAML/JSON file, or a fixed list.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use regvol_core::{Agency, CfrReference, ValidationError};
use regvol_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

pub const ECFR_AGENCIES_PATH: &str = "/api/admin/v1/agencies.json";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed")]
    Fetch(#[from] FetchError),
    #[error("reading catalog file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing catalog json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("parsing catalog yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("catalog entry `{name}` is invalid: {source}")]
    InvalidAgency {
        name: String,
        #[source]
        source: ValidationError,
    },
    #[error("agency `{0}` appears more than once in the catalog")]
    DuplicateAgency(String),
    #[error("catalog contains no agencies")]
    Empty,
}

/// Source of the agency list a backfill iterates over.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn list_agencies(&self) -> Result<Vec<Agency>, CatalogError>;
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    agencies: Vec<CatalogEntry>,
}

// Extra keys such as `children`, `slug` or `display_name` are ignored.
#[derive(Debug, Deserialize)]
struct CatalogEntry {
    name: String,
    #[serde(default)]
    short_name: Option<String>,
    #[serde(default)]
    cfr_references: Vec<CfrReference>,
}

fn into_agencies(document: CatalogDocument) -> Result<Vec<Agency>, CatalogError> {
    if document.agencies.is_empty() {
        return Err(CatalogError::Empty);
    }
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(document.agencies.len());
    for entry in document.agencies {
        let agency = Agency::new(&entry.name, entry.short_name, entry.cfr_references).map_err(
            |source| CatalogError::InvalidAgency {
                name: entry.name.clone(),
                source,
            },
        )?;
        if !seen.insert(agency.name.clone()) {
            return Err(CatalogError::DuplicateAgency(agency.name));
        }
        out.push(agency);
    }
    Ok(out)
}

pub fn parse_catalog_json(bytes: &[u8]) -> Result<Vec<Agency>, CatalogError> {
    into_agencies(serde_json::from_slice(bytes)?)
}

pub fn parse_catalog_yaml(text: &str) -> Result<Vec<Agency>, CatalogError> {
    into_agencies(serde_yaml::from_str(text)?)
}

/// Keep agencies whose name or short name matches one of `needles`; an empty filter keeps all.
pub fn filter_agencies(agencies: Vec<Agency>, needles: &[String]) -> Vec<Agency> {
    if needles.is_empty() {
        return agencies;
    }
    agencies
        .into_iter()
        .filter(|agency| needles.iter().any(|needle| agency.matches(needle)))
        .collect()
}

/// Top-level agencies from the eCFR admin API.
#[derive(Debug, Clone)]
pub struct EcfrAgencyCatalog {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl EcfrAgencyCatalog {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), ECFR_AGENCIES_PATH)
    }
}

#[async_trait]
impl Catalog for EcfrAgencyCatalog {
    async fn list_agencies(&self) -> Result<Vec<Agency>, CatalogError> {
        let url = self.url();
        let response = self.http.fetch(&url, &[]).await?;
        let agencies = parse_catalog_json(&response.body)?;
        info!(count = agencies.len(), %url, "loaded agency catalog");
        Ok(agencies)
    }
}

/// Catalog read from disk; `.yaml`/`.yml` parse as YAML, anything else as JSON.
#[derive(Debug, Clone)]
pub struct FileCatalog {
    path: PathBuf,
}

impl FileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_yaml(&self) -> bool {
        matches!(
            self.path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        )
    }
}

#[async_trait]
impl Catalog for FileCatalog {
    async fn list_agencies(&self) -> Result<Vec<Agency>, CatalogError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| CatalogError::Io {
                path: self.path.clone(),
                source,
            })?;
        let agencies = if self.is_yaml() {
            parse_catalog_yaml(&text)?
        } else {
            parse_catalog_json(text.as_bytes())?
        };
        info!(count = agencies.len(), path = %self.path.display(), "loaded agency catalog");
        Ok(agencies)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    agencies: Vec<Agency>,
}

impl StaticCatalog {
    pub fn new(agencies: Vec<Agency>) -> Self {
        Self { agencies }
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn list_agencies(&self) -> Result<Vec<Agency>, CatalogError> {
        if self.agencies.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(self.agencies.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const ECFR_SAMPLE: &str = r#"{
      "agencies": [
        {
          "name": "Department of Agriculture",
          "short_name": "USDA",
          "display_name": "Agriculture Department",
          "slug": "agriculture-department",
          "children": [{"name": "Agricultural Marketing Service", "cfr_references": []}],
          "cfr_references": [
            {"title": 2, "chapter": "IV"},
            {"title": 7, "subtitle": "A"}
          ]
        },
        {
          "name": "Farm Credit Administration",
          "short_name": null,
          "cfr_references": [{"title": 12, "chapter": "VI"}]
        }
      ]
    }"#;

    #[test]
    fn ecfr_shape_parses_top_level_agencies_only() {
        let agencies = parse_catalog_json(ECFR_SAMPLE.as_bytes()).unwrap();
        assert_eq!(agencies.len(), 2);
        assert_eq!(agencies[0].short_name.as_deref(), Some("USDA"));
        assert_eq!(
            agencies[0].cfr_references,
            vec![
                CfrReference::new(2).with_chapter("IV"),
                CfrReference {
                    subtitle: Some("A".into()),
                    ..CfrReference::new(7)
                },
            ]
        );
        assert_eq!(agencies[1].short_name, None);
    }

    #[test]
    fn invalid_and_duplicate_entries_are_rejected() {
        let bad_title = r#"{"agencies":[{"name":"X","cfr_references":[{"title":0}]}]}"#;
        assert!(matches!(
            parse_catalog_json(bad_title.as_bytes()),
            Err(CatalogError::InvalidAgency { .. })
        ));

        let dup = r#"{"agencies":[{"name":"X","cfr_references":[]},{"name":"X","cfr_references":[]}]}"#;
        assert!(matches!(
            parse_catalog_json(dup.as_bytes()),
            Err(CatalogError::DuplicateAgency(name)) if name == "X"
        ));

        assert!(matches!(
            parse_catalog_json(br#"{"agencies":[]}"#),
            Err(CatalogError::Empty)
        ));
    }

    #[test]
    fn filter_matches_name_or_short_name() {
        let agencies = parse_catalog_json(ECFR_SAMPLE.as_bytes()).unwrap();
        let kept = filter_agencies(agencies.clone(), &["usda".to_string()]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "Department of Agriculture");
        assert_eq!(filter_agencies(agencies, &[]).len(), 2);
    }

    #[tokio::test]
    async fn file_catalog_reads_yaml_and_json() {
        let dir = tempdir().expect("tempdir");
        let yaml_path = dir.path().join("agencies.yaml");
        tokio::fs::write(
            &yaml_path,
            "agencies:\n  - name: Alpha\n    short_name: A\n    cfr_references:\n      - title: 1\n        part: \"5\"\n",
        )
        .await
        .unwrap();
        let json_path = dir.path().join("agencies.json");
        tokio::fs::write(&json_path, ECFR_SAMPLE).await.unwrap();

        let yaml = FileCatalog::new(&yaml_path).list_agencies().await.unwrap();
        assert_eq!(yaml[0].name, "Alpha");
        assert_eq!(yaml[0].cfr_references[0], CfrReference::new(1).with_part("5"));

        let json = FileCatalog::new(&json_path).list_agencies().await.unwrap();
        assert_eq!(json.len(), 2);

        let missing = FileCatalog::new(dir.path().join("nope.json"))
            .list_agencies()
            .await;
        assert!(matches!(missing, Err(CatalogError::Io { .. })));
    }
}
