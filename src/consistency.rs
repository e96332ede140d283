//! Cross-stage unit-set checks.
//!
//! After every stage the driver compares the unit ids that went in with the
//! unit ids that came out. Mismatches are logged and returned as a
//! [`ConsistencyReport`] but never stop the pipeline: downstream stages run on
//! the valid subset and the operator re-runs just the listed units.

use crate::config::StageName;
use crate::error::StoreError;
use crate::store::UnitStore;
use crate::unit::UnitId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Result of comparing one stage transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub from: Option<StageName>,
    pub to: Option<StageName>,
    pub upstream_count: usize,
    pub downstream_count: usize,
    /// Present upstream, absent (or invalid) downstream.
    pub missing: BTreeSet<UnitId>,
    /// Present downstream, unknown upstream.
    pub unexpected: BTreeSet<UnitId>,
    /// Present downstream but corrupt or produced by a stale code version.
    pub invalid: BTreeSet<UnitId>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.invalid.is_empty()
    }

    fn label(&self) -> String {
        match (self.from, self.to) {
            (Some(f), Some(t)) => format!("{f} → {t}"),
            (None, Some(t)) => format!("source → {t}"),
            (Some(f), None) => format!("{f} → ?"),
            (None, None) => "check".to_string(),
        }
    }

    /// Emit the report as a structured warning (or an info line when clean).
    pub fn log(&self) {
        if self.is_consistent() {
            info!(
                "{}: {} units consistent",
                self.label(),
                self.downstream_count
            );
            return;
        }
        warn!(
            missing = self.missing.len(),
            unexpected = self.unexpected.len(),
            invalid = self.invalid.len(),
            "{}: unit sets differ; missing [{}], unexpected [{}], invalid [{}]",
            self.label(),
            join_ids(&self.missing),
            join_ids(&self.unexpected),
            join_ids(&self.invalid),
        );
    }
}

fn join_ids(ids: &BTreeSet<UnitId>) -> String {
    ids.iter().map(UnitId::as_str).collect::<Vec<_>>().join(", ")
}

/// Compare two id sets. Never fails.
pub fn check(upstream: &BTreeSet<UnitId>, downstream: &BTreeSet<UnitId>) -> ConsistencyReport {
    ConsistencyReport {
        from: None,
        to: None,
        upstream_count: upstream.len(),
        downstream_count: downstream.len(),
        missing: upstream.difference(downstream).cloned().collect(),
        unexpected: downstream.difference(upstream).cloned().collect(),
        invalid: BTreeSet::new(),
    }
}

/// Compare a stage's input ids with the *current* artifacts of its output
/// store. Artifacts that are listed but unreadable or stale count as
/// `invalid` and, when expected upstream, as `missing`.
pub fn check_stage(
    from: Option<StageName>,
    to: StageName,
    upstream: &BTreeSet<UnitId>,
    output: &UnitStore,
    code_version: &str,
) -> Result<ConsistencyReport, StoreError> {
    let listed = output.list_ids()?;
    let current = output.current_ids(code_version)?;

    let mut report = check(upstream, &current);
    report.from = from;
    report.to = Some(to);
    report.invalid = listed.difference(&current).cloned().collect();
    // A stale artifact unknown upstream is both unexpected and invalid;
    // report it once, as invalid.
    report.unexpected = report
        .unexpected
        .difference(&report.invalid)
        .cloned()
        .collect();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ArtifactKind;

    fn ids(items: &[&str]) -> BTreeSet<UnitId> {
        items.iter().map(|s| UnitId::parse(s).unwrap()).collect()
    }

    #[test]
    fn reports_missing_unit() {
        let report = check(&ids(&["a", "b", "c"]), &ids(&["a", "c"]));
        assert_eq!(report.missing, ids(&["b"]));
        assert!(report.unexpected.is_empty());
        assert!(!report.is_consistent());
    }

    #[test]
    fn reports_unexpected_unit() {
        let report = check(&ids(&["a"]), &ids(&["a", "z"]));
        assert!(report.missing.is_empty());
        assert_eq!(report.unexpected, ids(&["z"]));
    }

    #[test]
    fn identical_sets_are_consistent() {
        let report = check(&ids(&["a", "b"]), &ids(&["a", "b"]));
        assert!(report.is_consistent());
        report.log();
    }

    #[test]
    fn stage_check_flags_stale_and_corrupt_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let out = UnitStore::open(dir.path(), ArtifactKind::Text).unwrap();
        let put = |u: &str, v: &str| {
            out.put(&UnitId::parse(u).unwrap(), b"x", v, "-").unwrap();
        };
        put("a", "v2");
        put("b", "v1");
        put("c", "v2");
        put("orphan", "v1");
        std::fs::write(out.payload_path(&UnitId::parse("c").unwrap()), b"tampered").unwrap();

        let report = check_stage(
            Some(StageName::Extract),
            StageName::Parse,
            &ids(&["a", "b", "c", "d"]),
            &out,
            "v2",
        )
        .unwrap();

        assert_eq!(report.missing, ids(&["b", "c", "d"]));
        assert_eq!(report.invalid, ids(&["b", "c", "orphan"]));
        assert!(report.unexpected.is_empty());
        assert_eq!(report.downstream_count, 1);
        report.log();
    }
}
