//! Dataset export and submission.
//!
//! Turns the joined `personal.csv` plus the extracted texts into two JSON
//! documents a downstream corpus service ingests:
//!
//! * `dataset.json`: dataset metadata and one author entry per subject
//! * `texts.json`: `{"texts": [{"entity_id", "text"}, …]}`, one per subject
//!   whose text is available
//!
//! Texts are attached by unit id. The id is the file stem of the text
//! artifact and the first column of `personal.csv`, so no name matching is
//! involved.
//!
//! [`submit`] then POSTs the metadata to `<api>/api/<dataset_id>` and each
//! text to `<api>/api/<dataset_id>/ingest`.

use crate::error::PipelineError;
use crate::pipeline::join::extract_year;
use crate::store::UnitSource;
use crate::unit::UnitId;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub const DATASET_FILE: &str = "dataset.json";
pub const TEXTS_FILE: &str = "texts.json";

const WIKIDATA_API: &str = "https://www.wikidata.org/w/api.php";
const USER_AGENT: &str = concat!("bio2csv/", env!("CARGO_PKG_VERSION"));

// ── Options ──────────────────────────────────────────────────────────────────

/// Dataset-level metadata written into `dataset.json`.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub dataset_id: String,
    pub name: String,
    pub description: String,
    pub specification_version: String,
    /// Entity id of the subjects' field, attached to every author.
    pub field: String,
    /// Description keyword a lookup hit must contain to be accepted.
    pub lookup_keyword: String,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            dataset_id: "women-in-math".to_string(),
            name: "Women in Mathematics".to_string(),
            description: "Biographical data of women mathematicians from 1800s-1900s".to_string(),
            specification_version: "0.0.1".to_string(),
            field: "wikidata:Q395".to_string(),
            lookup_keyword: "mathematician".to_string(),
        }
    }
}

// ── Documents ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiographicalData {
    pub birth_year: Option<i32>,
    pub death_year: Option<i32>,
    pub birthplace: Option<String>,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub entity_id: String,
    /// Alternate ids for the same subject (the local id when a Wikidata id
    /// was found).
    pub entity_ids: Option<Vec<String>>,
    pub entity_type: String,
    pub confidence: f64,
    pub name: String,
    pub biographical_data: BiographicalData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub dataset_id: String,
    pub name: String,
    pub specification_version: String,
    pub description: String,
    pub authors: Vec<Author>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextEntry {
    pub entity_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TextsFile {
    texts: Vec<TextEntry>,
}

/// Output of [`prepare_dataset`].
#[derive(Debug, Clone)]
pub struct PreparedDataset {
    pub dataset: Dataset,
    pub texts: Vec<TextEntry>,
}

impl PreparedDataset {
    pub fn wikidata_count(&self) -> usize {
        self.dataset
            .authors
            .iter()
            .filter(|a| a.entity_id.starts_with("wikidata:"))
            .count()
    }

    pub fn local_count(&self) -> usize {
        self.dataset
            .authors
            .iter()
            .filter(|a| a.entity_id.starts_with("local:"))
            .count()
    }
}

/// One row of `personal.csv`.
#[derive(Debug, Deserialize)]
struct PersonalRow {
    unit_id: String,
    full_name: String,
    #[serde(default)]
    birthdate: Option<String>,
    #[serde(default)]
    deathdate: Option<String>,
}

// ── Entity lookup ────────────────────────────────────────────────────────────

/// Resolves a subject name to an external entity id (a Wikidata `Q…` id).
#[async_trait]
pub trait EntityLookup: Send + Sync {
    /// `None` when nothing suitable was found or the lookup failed.
    async fn lookup(&self, name: &str, keyword: &str) -> Option<String>;
}

/// [`EntityLookup`] backed by the Wikidata `wbsearchentities` API.
pub struct WikidataLookup {
    client: reqwest::Client,
    api_url: String,
}

#[derive(Deserialize)]
struct WikidataSearch {
    #[serde(default)]
    search: Vec<WikidataHit>,
}

#[derive(Deserialize)]
struct WikidataHit {
    id: String,
    #[serde(default)]
    description: Option<String>,
}

impl WikidataLookup {
    pub fn new(timeout_secs: u64) -> Result<Self, PipelineError> {
        Self::with_api_url(WIKIDATA_API, timeout_secs)
    }

    pub fn with_api_url(api_url: impl Into<String>, timeout_secs: u64) -> Result<Self, PipelineError> {
        let api_url = api_url.into();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| PipelineError::RequestFailed {
                url: api_url.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { client, api_url })
    }
}

#[async_trait]
impl EntityLookup for WikidataLookup {
    async fn lookup(&self, name: &str, keyword: &str) -> Option<String> {
        let response = self
            .client
            .get(&self.api_url)
            .query(&[
                ("action", "wbsearchentities"),
                ("format", "json"),
                ("language", "en"),
                ("type", "item"),
                ("search", name),
                ("limit", "3"),
            ])
            .send()
            .await;

        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!("Wikidata lookup for '{}': HTTP {}", name, r.status());
                return None;
            }
            Err(e) => {
                warn!("Wikidata lookup for '{}' failed: {}", name, e);
                return None;
            }
        };

        let found: WikidataSearch = match response.json().await {
            Ok(found) => found,
            Err(e) => {
                warn!("Wikidata lookup for '{}': bad response: {}", name, e);
                return None;
            }
        };
        pick_hit(&found.search, keyword)
    }
}

fn pick_hit(hits: &[WikidataHit], keyword: &str) -> Option<String> {
    let keyword = keyword.to_lowercase();
    hits.iter()
        .find(|h| {
            h.description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&keyword))
        })
        .map(|h| h.id.clone())
}

// ── Preparation ──────────────────────────────────────────────────────────────

static RE_ENTITY_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:wikidata:Q[0-9]+|local:[a-z0-9][a-z0-9-]*:[a-z0-9_]+)$").unwrap()
});

/// True for `wikidata:Q…` and `local:<dataset>:<id>` entity ids.
pub fn is_valid_entity_id(id: &str) -> bool {
    RE_ENTITY_ID.is_match(id)
}

fn local_entity_id(dataset_id: &str, unit_id: &UnitId) -> String {
    format!("local:{dataset_id}:{unit_id}")
}

/// Build the dataset from `<tables_dir>/personal.csv` and the text store.
///
/// `lookup` is optional; without it every author gets a local entity id.
/// Rows with an unusable unit id or entity id are skipped with a warning.
pub async fn prepare_dataset(
    tables_dir: &Path,
    texts: &dyn UnitSource,
    lookup: Option<&dyn EntityLookup>,
    options: &ExportOptions,
) -> Result<PreparedDataset, PipelineError> {
    let personal = tables_dir.join("personal.csv");
    let read_err = |detail: String| PipelineError::ReadFailed {
        path: personal.clone(),
        detail,
    };
    let mut reader = csv::Reader::from_path(&personal).map_err(|e| read_err(e.to_string()))?;
    let rows: Vec<PersonalRow> = reader
        .deserialize()
        .collect::<Result<_, _>>()
        .map_err(|e| read_err(e.to_string()))?;
    info!("Preparing dataset '{}' from {} subjects", options.dataset_id, rows.len());

    let mut authors = Vec::with_capacity(rows.len());
    let mut text_entries = Vec::new();

    for row in rows {
        let Some(unit_id) = UnitId::parse(&row.unit_id) else {
            warn!("Skipping row with invalid unit id '{}'", row.unit_id);
            continue;
        };
        let local_id = local_entity_id(&options.dataset_id, &unit_id);

        let external = match lookup {
            Some(l) => l.lookup(&row.full_name, &options.lookup_keyword).await,
            None => None,
        };
        let (entity_id, entity_ids, confidence) = match external {
            Some(qid) => (format!("wikidata:{qid}"), Some(vec![local_id]), 0.8),
            None => (local_id, None, 0.5),
        };

        let all_valid = is_valid_entity_id(&entity_id)
            && entity_ids
                .iter()
                .flatten()
                .all(|id| is_valid_entity_id(id));
        if !all_valid {
            warn!("{}: invalid entity id '{}', skipped", unit_id, entity_id);
            continue;
        }

        match texts.load(&unit_id) {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(text) if !text.trim().is_empty() => text_entries.push(TextEntry {
                    entity_id: entity_id.clone(),
                    text,
                }),
                Ok(_) => debug!("{}: empty text, not exported", unit_id),
                Err(e) => warn!("{}: text is not UTF-8 ({})", unit_id, e),
            },
            Err(e) => debug!("{}: no text ({})", unit_id, e),
        }

        authors.push(Author {
            entity_id,
            entity_ids,
            entity_type: "person".to_string(),
            confidence,
            name: row.full_name,
            biographical_data: BiographicalData {
                birth_year: extract_year(row.birthdate.as_deref()),
                death_year: extract_year(row.deathdate.as_deref()),
                birthplace: None,
                field: options.field.clone(),
            },
        });
    }

    let prepared = PreparedDataset {
        dataset: Dataset {
            dataset_id: options.dataset_id.clone(),
            name: options.name.clone(),
            specification_version: options.specification_version.clone(),
            description: options.description.clone(),
            authors,
        },
        texts: text_entries,
    };
    info!(
        "Prepared {} authors ({} Wikidata, {} local), text for {}",
        prepared.dataset.authors.len(),
        prepared.wikidata_count(),
        prepared.local_count(),
        prepared.texts.len()
    );
    Ok(prepared)
}

/// Write `dataset.json` and `texts.json` into `export_dir`, each atomically.
pub fn save(prepared: &PreparedDataset, export_dir: &Path) -> Result<(PathBuf, PathBuf), PipelineError> {
    std::fs::create_dir_all(export_dir).map_err(|e| PipelineError::OutputWriteFailed {
        path: export_dir.to_path_buf(),
        source: e,
    })?;

    let dataset_path = export_dir.join(DATASET_FILE);
    write_json(export_dir, &dataset_path, &prepared.dataset)?;

    let texts_path = export_dir.join(TEXTS_FILE);
    let texts = TextsFile {
        texts: prepared.texts.clone(),
    };
    write_json(export_dir, &texts_path, &texts)?;

    Ok((dataset_path, texts_path))
}

fn write_json<T: Serialize>(dir: &Path, path: &Path, value: &T) -> Result<(), PipelineError> {
    let write_err = |source: std::io::Error| PipelineError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| write_err(e.into()))?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(&bytes).map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

// ── Submission ───────────────────────────────────────────────────────────────

/// What [`submit`] sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubmitMode {
    /// Metadata, then texts. A metadata failure stops before any text.
    #[default]
    All,
    MetadataOnly,
    TextsOnly,
}

impl FromStr for SubmitMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(SubmitMode::All),
            "metadata-only" => Ok(SubmitMode::MetadataOnly),
            "texts-only" => Ok(SubmitMode::TextsOnly),
            other => Err(PipelineError::InvalidConfig(format!(
                "unknown submit mode '{other}' (expected all, metadata-only or texts-only)"
            ))),
        }
    }
}

/// Outcome of a submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubmitReport {
    pub metadata_submitted: bool,
    pub authors: usize,
    pub texts_ingested: usize,
    pub texts_failed: usize,
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, PipelineError> {
    let bytes = std::fs::read(path).map_err(|e| PipelineError::ReadFailed {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    serde_json::from_slice(&bytes).map_err(|e| PipelineError::ReadFailed {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

async fn post_json<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    body: &T,
) -> Result<(), PipelineError> {
    let request_err = |reason: String| PipelineError::RequestFailed {
        url: url.to_string(),
        reason,
    };
    let response = client.post(url).json(body).send().await.map_err(|e| {
        if e.is_connect() {
            request_err(format!("could not connect ({e}); is the API running?"))
        } else {
            request_err(e.to_string())
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(request_err(format!("HTTP {status}: {body}")));
    }
    Ok(())
}

/// Submit a saved export to the corpus API at `api_url`.
///
/// Text failures are counted in the report, not returned as errors.
pub async fn submit(
    api_url: &str,
    export_dir: &Path,
    mode: SubmitMode,
    timeout_secs: u64,
) -> Result<SubmitReport, PipelineError> {
    let api_url = api_url.trim_end_matches('/');
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| PipelineError::RequestFailed {
            url: api_url.to_string(),
            reason: e.to_string(),
        })?;

    let dataset: Dataset = read_json(&export_dir.join(DATASET_FILE))?;
    let dataset_url = format!("{}/api/{}", api_url, dataset.dataset_id);
    let mut report = SubmitReport::default();

    if mode != SubmitMode::TextsOnly {
        info!("Submitting metadata to {}", dataset_url);
        post_json(&client, &dataset_url, &dataset).await?;
        report.metadata_submitted = true;
        report.authors = dataset.authors.len();
        info!("Submitted {} authors", report.authors);
    }

    if mode == SubmitMode::MetadataOnly {
        return Ok(report);
    }

    let texts_path = export_dir.join(TEXTS_FILE);
    if !texts_path.exists() {
        warn!("No texts file at {}", texts_path.display());
        return Ok(report);
    }
    let texts: TextsFile = read_json(&texts_path)?;
    let ingest_url = format!("{dataset_url}/ingest");
    info!("Ingesting {} texts to {}", texts.texts.len(), ingest_url);

    for (idx, entry) in texts.texts.iter().enumerate() {
        match post_json(&client, &ingest_url, entry).await {
            Ok(()) => {
                debug!("[{}/{}] {} ingested", idx + 1, texts.texts.len(), entry.entity_id);
                report.texts_ingested += 1;
            }
            Err(e) => {
                warn!("[{}/{}] {} failed: {}", idx + 1, texts.texts.len(), entry.entity_id, e);
                report.texts_failed += 1;
            }
        }
    }

    info!(
        "Ingested {}/{} texts",
        report.texts_ingested,
        texts.texts.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ArtifactKind, UnitStore};

    struct FixedLookup(Option<&'static str>);

    #[async_trait]
    impl EntityLookup for FixedLookup {
        async fn lookup(&self, _name: &str, _keyword: &str) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    fn write_personal(dir: &Path) {
        std::fs::write(
            dir.join("personal.csv"),
            "unit_id,full_name,last_name,first_name,birthdate,deathdate\n\
             adams_rachel,Rachel Blodgett Adams,adams,rachel,July 1894,1982\n\
             doe_jane,Jane Doe,doe,jane,,\n",
        )
        .unwrap();
    }

    fn text_store(dir: &Path) -> UnitStore {
        let store = UnitStore::open(dir.join("text"), ArtifactKind::Text).unwrap();
        store
            .put(&UnitId::parse("adams_rachel").unwrap(), b"Rachel Adams was born ...", "extract-v1", "-")
            .unwrap();
        store
    }

    #[tokio::test]
    async fn local_ids_without_lookup() {
        let dir = tempfile::tempdir().unwrap();
        write_personal(dir.path());
        let texts = text_store(dir.path());

        let prepared = prepare_dataset(dir.path(), &texts, None, &ExportOptions::default())
            .await
            .unwrap();

        let authors = &prepared.dataset.authors;
        assert_eq!(authors.len(), 2);
        assert_eq!(authors[0].entity_id, "local:women-in-math:adams_rachel");
        assert_eq!(authors[0].confidence, 0.5);
        assert!(authors[0].entity_ids.is_none());
        assert_eq!(authors[0].biographical_data.birth_year, Some(1894));
        assert_eq!(authors[0].biographical_data.death_year, Some(1982));
        assert_eq!(authors[1].biographical_data.birth_year, None);

        // Only adams_rachel has text.
        assert_eq!(prepared.texts.len(), 1);
        assert_eq!(prepared.texts[0].entity_id, "local:women-in-math:adams_rachel");
        assert_eq!(prepared.local_count(), 2);
    }

    #[tokio::test]
    async fn lookup_hit_keeps_local_id_as_alternate() {
        let dir = tempfile::tempdir().unwrap();
        write_personal(dir.path());
        let texts = text_store(dir.path());
        let lookup = FixedLookup(Some("Q7279907"));

        let prepared = prepare_dataset(dir.path(), &texts, Some(&lookup), &ExportOptions::default())
            .await
            .unwrap();

        let first = &prepared.dataset.authors[0];
        assert_eq!(first.entity_id, "wikidata:Q7279907");
        assert_eq!(first.confidence, 0.8);
        assert_eq!(
            first.entity_ids.as_deref(),
            Some(&["local:women-in-math:adams_rachel".to_string()][..])
        );
        assert_eq!(prepared.texts[0].entity_id, "wikidata:Q7279907");
        assert_eq!(prepared.wikidata_count(), 2);
    }

    #[tokio::test]
    async fn accented_subject_keeps_a_local_id() {
        use crate::pipeline::join::{join, write_tables};
        use crate::record::BiographyRecord;

        let dir = tempfile::tempdir().unwrap();
        let unit_id = UnitId::from_name("Châtelet, Émilie du").unwrap();
        let record = BiographyRecord {
            name: Some("Émilie du Châtelet".into()),
            birthdate: Some("1706".into()),
            ..Default::default()
        };
        write_tables(&join(&[(unit_id.clone(), record)]), dir.path()).unwrap();
        let texts = UnitStore::open(dir.path().join("text"), ArtifactKind::Text).unwrap();
        texts.put(&unit_id, "Émilie du Châtelet ...".as_bytes(), "extract-v1", "-").unwrap();

        let prepared = prepare_dataset(dir.path(), &texts, None, &ExportOptions::default())
            .await
            .unwrap();

        let authors = &prepared.dataset.authors;
        assert_eq!(authors.len(), 1);
        assert_eq!(authors[0].entity_id, "local:women-in-math:chatelet_emilie_du");
        assert!(is_valid_entity_id(&authors[0].entity_id));
        assert_eq!(authors[0].name, "Émilie du Châtelet");
        assert_eq!(prepared.texts.len(), 1);
    }

    #[tokio::test]
    async fn save_writes_both_documents() {
        let dir = tempfile::tempdir().unwrap();
        write_personal(dir.path());
        let texts = text_store(dir.path());
        let prepared = prepare_dataset(dir.path(), &texts, None, &ExportOptions::default())
            .await
            .unwrap();

        let out = dir.path().join("export");
        let (dataset_path, texts_path) = save(&prepared, &out).unwrap();

        let dataset: Dataset = read_json(&dataset_path).unwrap();
        assert_eq!(dataset.dataset_id, "women-in-math");
        assert_eq!(dataset.authors.len(), 2);
        let raw: serde_json::Value = read_json(&texts_path).unwrap();
        assert_eq!(raw["texts"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_personal_table_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let texts = text_store(dir.path());
        let err = prepare_dataset(dir.path(), &texts, None, &ExportOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ReadFailed { .. }));
    }

    #[tokio::test]
    async fn submit_without_export_fails_before_any_request() {
        let dir = tempfile::tempdir().unwrap();
        let err = submit("http://127.0.0.1:9", dir.path(), SubmitMode::All, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ReadFailed { .. }));
    }

    #[test]
    fn entity_id_format() {
        assert!(is_valid_entity_id("wikidata:Q395"));
        assert!(is_valid_entity_id("local:women-in-math:adams_rachel"));
        assert!(!is_valid_entity_id("wikidata:395"));
        assert!(!is_valid_entity_id("local:women-in-math:Adams Rachel"));
    }

    #[test]
    fn hit_must_mention_keyword() {
        let hits = vec![
            WikidataHit {
                id: "Q1".into(),
                description: Some("American painter".into()),
            },
            WikidataHit {
                id: "Q2".into(),
                description: None,
            },
            WikidataHit {
                id: "Q3".into(),
                description: Some("American Mathematician (1894-1982)".into()),
            },
        ];
        assert_eq!(pick_hit(&hits, "mathematician").as_deref(), Some("Q3"));
        assert_eq!(pick_hit(&hits[..2], "mathematician"), None);
    }

    #[test]
    fn submit_mode_parses() {
        assert_eq!("metadata-only".parse::<SubmitMode>().unwrap(), SubmitMode::MetadataOnly);
        assert!("everything".parse::<SubmitMode>().is_err());
    }
}
