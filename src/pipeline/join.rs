//! Join stage: parsed records → six relational CSV tables.
//!
//! Every table carries `unit_id` as its first column, so rows from different
//! tables can be re-joined by any CSV tool. A record with three degrees fans
//! out to three `degrees` rows; a record with none contributes no rows there
//! but always contributes one `personal` row.
//!
//! Year columns go through [`extract_year`]. Everything else is passed
//! through as the generator wrote it.

use crate::error::{PipelineError, StoreError};
use crate::record::BiographyRecord;
use crate::store::UnitStore;
use crate::unit::{NameParts, UnitId};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Declared revision of the table layout.
pub const CODE_VERSION: &str = "join-v1";

pub const PERSONAL_COLUMNS: &[&str] = &[
    "unit_id",
    "full_name",
    "last_name",
    "first_name",
    "birthdate",
    "deathdate",
];
pub const DEGREE_COLUMNS: &[&str] = &[
    "unit_id",
    "degree_institution_name",
    "degree_type",
    "degree_year",
    "degree_advisor",
];
pub const EMPLOYMENT_COLUMNS: &[&str] = &[
    "unit_id",
    "employer",
    "job_title",
    "job_year_begin",
    "job_year_end",
    "reason_end",
];
pub const VISIT_COLUMNS: &[&str] = &["unit_id", "visit_location", "visit_reason", "visit_year"];
pub const HONOR_COLUMNS: &[&str] = &["unit_id", "honor_name", "honor_year"];
pub const PARENT_COLUMNS: &[&str] = &["unit_id", "name", "birthdate", "deathdate", "profession"];

// ── Year extraction ──────────────────────────────────────────────────────────

static RE_YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^0-9])(1[0-9]{3}|20[0-9]{2})(?:[^0-9]|$)").unwrap());

/// First standalone four-digit year in 1000–2099.
///
/// `"June 1932"` → 1932, `"1901-1903"` → 1901, `"unknown"` → `None`.
/// Digits that are part of a longer number never match.
pub fn extract_year(text: Option<&str>) -> Option<i32> {
    let caps = RE_YEAR.captures(text?)?;
    caps[1].parse().ok()
}

fn year_cell(text: &Option<String>) -> String {
    extract_year(text.as_deref())
        .map(|y| y.to_string())
        .unwrap_or_default()
}

fn cell(text: &Option<String>) -> String {
    text.clone().unwrap_or_default()
}

// ── Tables ───────────────────────────────────────────────────────────────────

/// One output table: a fixed header plus rows of the same width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    pub rows: Vec<Vec<String>>,
}

impl Table {
    fn new(name: &'static str, columns: &'static [&'static str]) -> Self {
        Self {
            name,
            columns,
            rows: Vec::new(),
        }
    }

    fn push(&mut self, row: Vec<String>) {
        debug_assert_eq!(row.len(), self.columns.len(), "row width for {}", self.name);
        self.rows.push(row);
    }

    pub fn file_name(&self) -> String {
        format!("{}.csv", self.name)
    }
}

/// The six tables produced by [`join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedTables {
    pub personal: Table,
    pub degrees: Table,
    pub employment: Table,
    pub visits: Table,
    pub honors: Table,
    pub parents: Table,
}

impl JoinedTables {
    fn empty() -> Self {
        Self {
            personal: Table::new("personal", PERSONAL_COLUMNS),
            degrees: Table::new("degrees", DEGREE_COLUMNS),
            employment: Table::new("employment", EMPLOYMENT_COLUMNS),
            visits: Table::new("visits", VISIT_COLUMNS),
            honors: Table::new("honors", HONOR_COLUMNS),
            parents: Table::new("parents", PARENT_COLUMNS),
        }
    }

    pub fn tables(&self) -> [&Table; 6] {
        [
            &self.personal,
            &self.degrees,
            &self.employment,
            &self.visits,
            &self.honors,
            &self.parents,
        ]
    }

    pub fn get(&self, name: &str) -> Option<&Table> {
        self.tables().into_iter().find(|t| t.name == name)
    }

    /// Unit ids that made it into the `personal` table.
    pub fn unit_ids(&self) -> std::collections::BTreeSet<UnitId> {
        self.personal
            .rows
            .iter()
            .filter_map(|row| row.first())
            .filter_map(|id| UnitId::parse(id))
            .collect()
    }
}

/// Surname and given names for the `personal` table.
///
/// The record's own name is used as written when it normalises to the same
/// id (ignoring a collision suffix), which keeps compound surnames such as
/// `Ball-Smith` whole. Otherwise both parts come from the unit id.
fn name_columns(unit_id: &UnitId, record: &BiographyRecord) -> (String, String) {
    if let Some(name) = record.name.as_deref() {
        if UnitId::from_name(name).is_some_and(|n| n.as_str() == unit_id.base()) {
            let parts = NameParts::parse(name);
            return (parts.last, parts.first);
        }
    }
    (unit_id.last_name().to_string(), unit_id.first_name())
}

/// Normalise records into the six tables. Never fails.
///
/// Row order follows `records` (callers pass units in ascending id order);
/// sub-entity rows keep the order the record lists them in.
pub fn join(records: &[(UnitId, BiographyRecord)]) -> JoinedTables {
    let mut t = JoinedTables::empty();

    for (unit_id, record) in records {
        let id = unit_id.to_string();
        let full_name = record
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| unit_id.display_name());

        let (last_name, first_name) = name_columns(unit_id, record);

        t.personal.push(vec![
            id.clone(),
            full_name,
            last_name,
            first_name,
            cell(&record.birthdate),
            cell(&record.deathdate),
        ]);

        for d in &record.degrees {
            t.degrees.push(vec![
                id.clone(),
                cell(&d.degree_institution_name),
                cell(&d.degree_type),
                year_cell(&d.degree_year),
                cell(&d.degree_advisor),
            ]);
        }
        for e in &record.employment {
            t.employment.push(vec![
                id.clone(),
                cell(&e.employer),
                cell(&e.job_title),
                year_cell(&e.job_year_begin),
                year_cell(&e.job_year_end),
                cell(&e.reason_end),
            ]);
        }
        for v in &record.visits {
            t.visits.push(vec![
                id.clone(),
                cell(&v.visit_location),
                cell(&v.visit_reason),
                year_cell(&v.visit_year),
            ]);
        }
        for h in &record.honors {
            t.honors.push(vec![
                id.clone(),
                cell(&h.honor_name),
                year_cell(&h.honor_year),
            ]);
        }
        for p in &record.parents {
            t.parents.push(vec![
                id.clone(),
                cell(&p.name),
                cell(&p.birthdate),
                cell(&p.deathdate),
                cell(&p.profession),
            ]);
        }
    }

    debug!(
        "Joined {} records: {} degrees, {} employment, {} visits, {} honors, {} parents",
        t.personal.rows.len(),
        t.degrees.rows.len(),
        t.employment.rows.len(),
        t.visits.rows.len(),
        t.honors.rows.len(),
        t.parents.rows.len()
    );
    t
}

/// Load every current record of the parse store, in ascending id order.
///
/// Stale or unreadable records are left out with a warning; the consistency
/// check reports them.
pub fn load_records(
    store: &UnitStore,
    code_version: &str,
) -> Result<Vec<(UnitId, BiographyRecord)>, StoreError> {
    let mut records = Vec::new();
    for unit_id in store.current_ids(code_version)? {
        let artifact = store.get(&unit_id)?;
        match BiographyRecord::from_slice(&artifact.payload) {
            Ok(record) => records.push((unit_id, record)),
            Err(e) => warn!("{}: record unreadable, not joined ({})", unit_id, e),
        }
    }
    Ok(records)
}

/// Write all six tables as `<dir>/<table>.csv`, each atomically.
///
/// Returns the paths written, in table order.
pub fn write_tables(tables: &JoinedTables, dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    std::fs::create_dir_all(dir).map_err(|e| PipelineError::OutputWriteFailed {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut written = Vec::with_capacity(6);
    for table in tables.tables() {
        let path = dir.join(table.file_name());
        write_table(table, dir, &path).map_err(|e| PipelineError::OutputWriteFailed {
            path: path.clone(),
            source: e,
        })?;
        info!("Wrote {} ({} rows)", path.display(), table.rows.len());
        written.push(path);
    }
    Ok(written)
}

fn write_table(table: &Table, dir: &Path, path: &Path) -> std::io::Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = csv::WriterBuilder::new().from_writer(tmp.as_file_mut());
        writer.write_record(table.columns)?;
        for row in &table.rows {
            writer.write_record(row)?;
        }
        // Check for error rather than implicitly flushing and ignoring.
        writer.flush()?;
    }
    tmp.as_file_mut().flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Degree, Honor};
    use crate::store::ArtifactKind;

    fn id(s: &str) -> UnitId {
        UnitId::parse(s).unwrap()
    }

    fn degree(kind: &str, year: &str) -> Degree {
        Degree {
            degree_type: Some(kind.into()),
            degree_year: Some(year.into()),
            ..Default::default()
        }
    }

    #[test]
    fn year_extraction() {
        assert_eq!(extract_year(Some("June 1932")), Some(1932));
        assert_eq!(extract_year(Some("1901-1903")), Some(1901));
        assert_eq!(extract_year(Some("c. 2011")), Some(2011));
        assert_eq!(extract_year(Some("unknown")), None);
        assert_eq!(extract_year(Some("12345")), None);
        assert_eq!(extract_year(Some("0999 or 2150")), None);
        assert_eq!(extract_year(None), None);
    }

    #[test]
    fn degrees_fan_out_per_unit() {
        let records = vec![(
            id("doe_jane"),
            BiographyRecord {
                name: Some("Jane Doe".into()),
                degrees: vec![
                    degree("BA", "1920"),
                    degree("MA", "June 1922"),
                    degree("PhD", "unknown"),
                ],
                ..Default::default()
            },
        )];
        let t = join(&records);

        assert_eq!(t.personal.rows.len(), 1);
        assert_eq!(t.degrees.rows.len(), 3);
        for row in &t.degrees.rows {
            assert_eq!(row[0], "doe_jane");
        }
        let years: Vec<&str> = t.degrees.rows.iter().map(|r| r[3].as_str()).collect();
        assert_eq!(years, vec!["1920", "1922", ""]);
        let kinds: Vec<&str> = t.degrees.rows.iter().map(|r| r[2].as_str()).collect();
        assert_eq!(kinds, vec!["BA", "MA", "PhD"]);
    }

    #[test]
    fn personal_names_come_from_unit_id() {
        let records = vec![
            (
                id("adams_rachel"),
                BiographyRecord {
                    name: Some("Rachel Blodgett Adams".into()),
                    birthdate: Some("July 1894".into()),
                    ..Default::default()
                },
            ),
            (id("roe_mary_ann"), BiographyRecord::default()),
        ];
        let t = join(&records);

        assert_eq!(
            t.personal.rows[0],
            vec!["adams_rachel", "Rachel Blodgett Adams", "adams", "rachel", "July 1894", ""]
        );
        assert_eq!(t.personal.rows[1][1], "Mary Ann Roe");
        assert_eq!(t.personal.rows[1][3], "mary ann");
    }

    #[test]
    fn collision_suffix_and_compound_surname() {
        let records = vec![
            (id("smith_mary"), BiographyRecord::default()),
            (id("smith_mary_2"), BiographyRecord::default()),
            (
                id("ball_smith_annie"),
                BiographyRecord {
                    name: Some("Ball-Smith, Annie".into()),
                    ..Default::default()
                },
            ),
            (
                id("chatelet_emilie_du_2"),
                BiographyRecord {
                    name: Some("Émilie du Châtelet".into()),
                    ..Default::default()
                },
            ),
        ];
        let t = join(&records);
        let names: Vec<(&str, &str, &str)> = t
            .personal
            .rows
            .iter()
            .map(|r| (r[1].as_str(), r[2].as_str(), r[3].as_str()))
            .collect();

        assert_eq!(names[0], ("Mary Smith", "smith", "mary"));
        assert_eq!(names[1], ("Mary Smith", "smith", "mary"));
        assert_eq!(names[2], ("Ball-Smith, Annie", "Ball-Smith", "Annie"));
        assert_eq!(names[3], ("Émilie du Châtelet", "Châtelet", "Émilie du"));
    }

    #[test]
    fn empty_input_still_has_headers() {
        let t = join(&[]);
        for table in t.tables() {
            assert!(table.rows.is_empty());
            assert_eq!(table.columns[0], "unit_id");
        }
        assert_eq!(t.get("honors").unwrap().columns, HONOR_COLUMNS);
        assert!(t.get("awards").is_none());
    }

    #[test]
    fn writes_six_csv_files() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![(
            id("doe_jane"),
            BiographyRecord {
                name: Some("Doe, Jane".into()),
                honors: vec![Honor {
                    honor_name: Some("Fellow, AAAS".into()),
                    honor_year: Some("1950".into()),
                }],
                ..Default::default()
            },
        )];
        let paths = write_tables(&join(&records), dir.path()).unwrap();
        assert_eq!(paths.len(), 6);

        let honors = std::fs::read_to_string(dir.path().join("honors.csv")).unwrap();
        assert_eq!(honors, "unit_id,honor_name,honor_year\ndoe_jane,\"Fellow, AAAS\",1950\n");

        let mut reader = csv::Reader::from_path(dir.path().join("personal.csv")).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.iter().collect::<Vec<_>>(), PERSONAL_COLUMNS);
        let row = reader.records().next().unwrap().unwrap();
        assert_eq!(&row[1], "Doe, Jane");

        let visits = std::fs::read_to_string(dir.path().join("visits.csv")).unwrap();
        assert_eq!(visits.lines().count(), 1);
    }

    #[test]
    fn load_records_ignores_stale_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store = UnitStore::open(dir.path(), ArtifactKind::Record).unwrap();
        store.put(&id("b"), br#"{"name": "B"}"#, "parse-v2", "-").unwrap();
        store.put(&id("a"), br#"{"name": "A"}"#, "parse-v2", "-").unwrap();
        store.put(&id("old"), br#"{"name": "Old"}"#, "parse-v1", "-").unwrap();

        let records = load_records(&store, "parse-v2").unwrap();
        let ids: Vec<&str> = records.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
