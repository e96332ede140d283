//! Engine-level tests: parse + join over a pre-filled text store, with a
//! scripted generator standing in for the LLM.

use async_trait::async_trait;
use bio2csv::config::StageName;
use bio2csv::pipeline::{extract, parse};
use bio2csv::{
    run_with_generator, ArtifactKind, Generator, PipelineConfig, PipelineReport, TransformError,
    UnitId, UnitStore,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const ADAMS: &str = r#"{
  "name": "Rachel Blodgett Adams",
  "birthdate": "July 11, 1894",
  "deathdate": "1982",
  "degrees": [
    {"degree_institution_name": "Radcliffe College", "degree_type": "PhD", "degree_year": "1921", "degree_advisor": "Julian Coolidge"},
    {"degree_institution_name": "Radcliffe College", "degree_type": "AB", "degree_year": "1915"}
  ],
  "employment": [{"employer": "Wheaton College", "job_title": "instructor", "job_year_begin": "1921", "job_year_end": "1922"}],
  "honors": [{"honor_name": "Phi Beta Kappa", "honor_year": "c. 1915"}]
}"#;

// Trailing comma: accepted after repair.
const DOE: &str = r#"{"name": "Jane Doe", "birthdate": "June 1932", "degrees": [{"degree_type": "MA",},],}"#;

// Unterminated string: beyond repair.
const ROE: &str = r#"{"name": "Mary Roe, "degrees": [{"degree_type": "PhD"#;

/// Replies by looking for a subject marker in the prompt.
#[derive(Default)]
struct ScriptedGenerator {
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, _system: &str, user: &str) -> Result<String, TransformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = if user.contains("ADAMS") {
            ADAMS
        } else if user.contains("DOE") {
            DOE
        } else if user.contains("ROE") {
            ROE
        } else {
            "{}"
        };
        Ok(reply.to_string())
    }
}

fn fill_texts(work: &Path, units: &[(&str, &str)]) {
    let store = UnitStore::open(work.join("text"), ArtifactKind::Text).unwrap();
    for (id, text) in units {
        store
            .put(&UnitId::parse(id).unwrap(), text.as_bytes(), extract::CODE_VERSION, "-")
            .unwrap();
    }
}

fn config(work: &Path) -> PipelineConfig {
    PipelineConfig::builder()
        .work_dir(work)
        .stages([StageName::Parse, StageName::Join])
        .build()
        .unwrap()
}

async fn run(config: &PipelineConfig, generator: &Arc<ScriptedGenerator>) -> PipelineReport {
    run_with_generator(config, Some(generator.clone() as Arc<dyn Generator>))
        .await
        .unwrap()
}

fn csv_rows(path: &Path) -> Vec<Vec<String>> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect()
}

#[tokio::test]
async fn parse_and_join_write_all_tables() {
    let dir = tempfile::tempdir().unwrap();
    fill_texts(
        dir.path(),
        &[
            ("adams_rachel_blodgett", "ADAMS, Rachel Blodgett. Born 1894."),
            ("doe_jane", "DOE, Jane. Born June 1932."),
        ],
    );
    let generator = Arc::new(ScriptedGenerator::default());
    let config = config(dir.path());

    let report = run(&config, &generator).await;

    assert!(!report.has_failures());
    assert!(report.is_consistent());
    let parse = report.summary(StageName::Parse).unwrap();
    assert_eq!(parse.processed, 2);
    assert_eq!(generator.calls(), 2);
    assert_eq!(report.tables.len(), 6);

    let tables = config.tables_dir();
    let personal = csv_rows(&tables.join("personal.csv"));
    assert_eq!(personal.len(), 2);
    assert_eq!(personal[0][0], "adams_rachel_blodgett");
    assert_eq!(personal[0][1], "Rachel Blodgett Adams");

    // Two degrees for adams, one (repaired) for doe.
    let degrees = csv_rows(&tables.join("degrees.csv"));
    assert_eq!(degrees.len(), 3);
    assert_eq!(degrees.iter().filter(|r| r[0] == "adams_rachel_blodgett").count(), 2);
    assert_eq!(degrees[0][3], "1921");

    let honors = csv_rows(&tables.join("honors.csv"));
    assert_eq!(honors.len(), 1);
    assert_eq!(honors[0][2], "1915");

    // Header-only tables still exist.
    assert!(csv_rows(&tables.join("parents.csv")).is_empty());
}

#[tokio::test]
async fn second_run_skips_everything() {
    let dir = tempfile::tempdir().unwrap();
    fill_texts(dir.path(), &[("doe_jane", "DOE, Jane.")]);
    let generator = Arc::new(ScriptedGenerator::default());
    let config = config(dir.path());

    run(&config, &generator).await;
    let before = std::fs::read(config.parsed_dir().join("doe_jane.json")).unwrap();
    let report = run(&config, &generator).await;

    let parse = report.summary(StageName::Parse).unwrap();
    assert_eq!((parse.processed, parse.skipped), (0, 1));
    assert_eq!(generator.calls(), 1);
    let after = std::fs::read(config.parsed_dir().join("doe_jane.json")).unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn version_bump_reprocesses_every_unit() {
    let dir = tempfile::tempdir().unwrap();
    fill_texts(
        dir.path(),
        &[("doe_jane", "DOE, Jane."), ("adams_rachel", "ADAMS, Rachel.")],
    );
    let generator = Arc::new(ScriptedGenerator::default());
    run(&config(dir.path()), &generator).await;

    let bumped = PipelineConfig::builder()
        .work_dir(dir.path())
        .stages([StageName::Parse, StageName::Join])
        .code_version(StageName::Parse, "parse-v2")
        .build()
        .unwrap();
    let report = run(&bumped, &generator).await;

    let parse = report.summary(StageName::Parse).unwrap();
    assert_eq!(parse.code_version, "parse-v2");
    assert_eq!(parse.processed, 2);
    assert_eq!(generator.calls(), 4);

    let store = UnitStore::open(bumped.parsed_dir(), ArtifactKind::Record).unwrap();
    let artifact = store.get(&UnitId::parse("doe_jane").unwrap()).unwrap();
    assert_eq!(artifact.provenance.code_version, "parse-v2");
    assert_ne!(parse::CODE_VERSION, "parse-v2");
}

#[tokio::test]
async fn unparseable_reply_fails_only_its_unit() {
    let dir = tempfile::tempdir().unwrap();
    fill_texts(
        dir.path(),
        &[
            ("adams_rachel", "ADAMS, Rachel."),
            ("doe_jane", "DOE, Jane."),
            ("roe_mary", "ROE, Mary."),
        ],
    );
    let generator = Arc::new(ScriptedGenerator::default());
    let config = config(dir.path());

    let report = run(&config, &generator).await;

    assert!(report.has_failures());
    let parse = report.summary(StageName::Parse).unwrap();
    assert_eq!((parse.processed, parse.failed), (2, 1));
    assert_eq!(parse.failures[0].unit_id.as_str(), "roe_mary");
    assert!(matches!(parse.failures[0].error, TransformError::Parse(_)));

    // Raw reply kept for inspection, no record written.
    assert!(config.rejected_dir().join("roe_mary.txt").exists());
    assert!(!config.parsed_dir().join("roe_mary.json").exists());

    // The text → parsed boundary reports the gap; join only sees the good two.
    let gap = report
        .consistency
        .iter()
        .find(|r| r.to == Some(StageName::Parse))
        .unwrap();
    assert_eq!(
        gap.missing.iter().map(UnitId::as_str).collect::<Vec<_>>(),
        vec!["roe_mary"]
    );
    let personal = csv_rows(&config.tables_dir().join("personal.csv"));
    assert_eq!(personal.len(), 2);
    assert!(personal.iter().all(|r| r[0] != "roe_mary"));

    // A rerun retries only the failed unit.
    let report = run(&config, &generator).await;
    let parse = report.summary(StageName::Parse).unwrap();
    assert_eq!((parse.processed, parse.skipped, parse.failed), (0, 2, 1));
    assert_eq!(generator.calls(), 4);
}

#[tokio::test]
async fn stale_text_is_not_parsed() {
    let dir = tempfile::tempdir().unwrap();
    let store = UnitStore::open(dir.path().join("text"), ArtifactKind::Text).unwrap();
    store
        .put(&UnitId::parse("doe_jane").unwrap(), b"DOE, Jane.", "extract-v0", "-")
        .unwrap();
    let generator = Arc::new(ScriptedGenerator::default());

    let report = run(&config(dir.path()), &generator).await;

    assert_eq!(generator.calls(), 0);
    assert_eq!(report.summary(StageName::Parse).unwrap().total(), 0);
}
