//! Split stage: source PDF → one PDF per biographical subject.
//!
//! ## Why plan first?
//!
//! The outline is read once, up front, into a [`SplitPlan`]: a pure mapping of
//! unit id → page range. The plan is the split stage's input source, so the
//! generic runner applies the same skip rule here as everywhere else: a unit
//! whose `split/<id>.pdf` exists with the current code version is not cut
//! again. The plan payload for a unit is its serialised [`Unit`], so with
//! fingerprint verification on, a changed page range is detected as a
//! changed input.
//!
//! ## Boundaries
//!
//! A subject starts at its bookmark page and ends on the page before the next
//! *later* bookmark of any kind (subject or not), or on the last page.
//! Bookmarks before `page_offset` and bookmarks whose trimmed title is a
//! single character (alphabetical section headings like "A") are not
//! subjects, but they still end the subject before them.

use super::pdfium;
use crate::error::{PipelineError, StoreError, TransformError};
use crate::runner::Transform;
use crate::store::UnitSource;
use crate::unit::{PageRange, Unit, UnitId};
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Declared revision of the split logic.
pub const CODE_VERSION: &str = "split-v1";

/// One bookmark of the source outline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlineEntry {
    pub title: String,
    /// 0-based page index the bookmark points at.
    pub page: usize,
}

impl OutlineEntry {
    pub fn new(title: impl Into<String>, page: usize) -> Self {
        Self {
            title: title.into(),
            page,
        }
    }

    fn is_subject(&self, page_offset: usize) -> bool {
        self.page >= page_offset && self.title.trim().chars().count() > 1
    }
}

/// Turn an outline into units.
///
/// Entries may arrive in any order; units are returned in page order, ties
/// kept in outline order. Duplicate ids get `_2`, `_3`, … in that order.
pub fn plan_units(entries: &[OutlineEntry], page_count: usize, page_offset: usize) -> Vec<Unit> {
    if page_count == 0 {
        return Vec::new();
    }

    let boundaries: BTreeSet<usize> = entries.iter().map(|e| e.page).collect();

    let mut subjects: Vec<&OutlineEntry> = entries
        .iter()
        .filter(|e| e.is_subject(page_offset))
        .filter(|e| {
            if e.page >= page_count {
                warn!("Bookmark '{}' points past the last page, ignored", e.title);
                return false;
            }
            true
        })
        .collect();
    subjects.sort_by_key(|e| e.page);

    let mut seen: HashMap<UnitId, usize> = HashMap::new();
    let mut units = Vec::with_capacity(subjects.len());

    for entry in subjects {
        let Some(base) = UnitId::from_name(&entry.title) else {
            warn!("Bookmark '{}' yields no usable id, ignored", entry.title);
            continue;
        };
        let count = seen.entry(base.clone()).or_insert(0);
        *count += 1;
        let unit_id = if *count == 1 {
            base
        } else {
            let id = base.with_suffix(*count);
            warn!("Duplicate subject '{}' stored as {}", entry.title, id);
            id
        };

        let end = boundaries
            .range(entry.page + 1..)
            .next()
            .map(|next| (next - 1).min(page_count - 1))
            .unwrap_or(page_count - 1);

        units.push(Unit {
            unit_id,
            title: entry.title.trim().to_string(),
            source_range: PageRange {
                start: entry.page,
                end,
            },
        });
    }
    units
}

// ── Outline reading ──────────────────────────────────────────────────────────

fn read_outline_blocking(bytes: &[u8]) -> Result<(Vec<OutlineEntry>, usize), String> {
    let pdfium = pdfium::bind().map_err(|e| e.to_string())?;
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| format!("{:?}", e))?;

    let page_count = document.pages().len() as usize;
    let mut entries = Vec::new();
    for bookmark in document.bookmarks().iter() {
        let Some(title) = bookmark.title() else {
            continue;
        };
        let page = bookmark
            .destination()
            .and_then(|dest| dest.page_index().ok());
        match page {
            Some(page) => entries.push(OutlineEntry::new(title, page as usize)),
            None => debug!("Bookmark '{}' has no page destination", title),
        }
    }
    Ok((entries, page_count))
}

/// Cut `range` out of `source` into a standalone PDF.
fn extract_range_blocking(source: &[u8], range: PageRange) -> Result<Vec<u8>, String> {
    let pdfium = pdfium::bind().map_err(|e| e.to_string())?;
    let src = pdfium
        .load_pdf_from_byte_slice(source, None)
        .map_err(|e| format!("{:?}", e))?;

    let total = src.pages().len() as usize;
    if range.is_empty() || range.end >= total {
        return Err(format!(
            "page range {}..={} outside document of {} pages",
            range.start, range.end, total
        ));
    }

    let mut out = pdfium.create_new_pdf().map_err(|e| format!("{:?}", e))?;
    out.pages_mut()
        .copy_page_range_from_document(
            &src,
            range.start as PdfPageIndex..=range.end as PdfPageIndex,
            0,
        )
        .map_err(|e| format!("{:?}", e))?;
    out.save_to_bytes().map_err(|e| format!("{:?}", e))
}

// ── Plan as a unit source ────────────────────────────────────────────────────

/// Units planned from the source outline. Input source of the split stage.
#[derive(Debug, Clone, Default)]
pub struct SplitPlan {
    units: BTreeMap<UnitId, Unit>,
}

impl SplitPlan {
    pub fn from_units(units: Vec<Unit>) -> Self {
        Self {
            units: units.into_iter().map(|u| (u.unit_id.clone(), u)).collect(),
        }
    }

    /// Read the outline of `source` (already loaded as `bytes`) and plan units.
    pub async fn from_pdf(
        source: &Path,
        bytes: Arc<Vec<u8>>,
        page_offset: usize,
    ) -> Result<Self, PipelineError> {
        let (entries, page_count) =
            tokio::task::spawn_blocking(move || read_outline_blocking(&bytes))
                .await
                .map_err(|e| PipelineError::Internal(format!("Outline task panicked: {}", e)))?
                .map_err(|detail| PipelineError::CorruptPdf {
                    path: source.to_path_buf(),
                    detail,
                })?;

        let units = plan_units(&entries, page_count, page_offset);
        info!(
            "Outline: {} bookmarks, {} pages → {} subjects",
            entries.len(),
            page_count,
            units.len()
        );
        if units.is_empty() {
            return Err(PipelineError::NoUnits {
                path: source.to_path_buf(),
                page_offset,
            });
        }
        Ok(Self::from_units(units))
    }

    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl UnitSource for SplitPlan {
    fn list_ids(&self) -> Result<BTreeSet<UnitId>, StoreError> {
        Ok(self.units.keys().cloned().collect())
    }

    fn load(&self, unit_id: &UnitId) -> Result<Vec<u8>, StoreError> {
        let unit = self.units.get(unit_id).ok_or_else(|| StoreError::NotFound {
            unit_id: unit_id.to_string(),
        })?;
        serde_json::to_vec(unit).map_err(|e| StoreError::Corrupt {
            unit_id: unit_id.to_string(),
            detail: e.to_string(),
        })
    }
}

/// The split stage transform: serialised [`Unit`] in, single-subject PDF out.
pub struct SplitTransform {
    source: Arc<Vec<u8>>,
}

impl SplitTransform {
    pub fn new(source: Arc<Vec<u8>>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Transform for SplitTransform {
    async fn apply(&self, unit_id: &UnitId, input: &[u8]) -> Result<Vec<u8>, TransformError> {
        let unit: Unit = serde_json::from_slice(input).map_err(|e| {
            TransformError::InputUnavailable {
                detail: format!("bad plan entry: {e}"),
            }
        })?;
        let source = Arc::clone(&self.source);
        let range = unit.source_range;

        let pdf = tokio::task::spawn_blocking(move || extract_range_blocking(&source, range))
            .await
            .map_err(|e| TransformError::Pdf {
                detail: format!("split task panicked: {e}"),
            })?
            .map_err(|detail| TransformError::Pdf { detail })?;

        debug!(
            "{}: pages {}..={} → {} bytes",
            unit_id,
            range.start,
            range.end,
            pdf.len()
        );
        Ok(pdf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(title: &str, page: usize) -> OutlineEntry {
        OutlineEntry::new(title, page)
    }

    fn ranges(units: &[Unit]) -> Vec<(&str, usize, usize)> {
        units
            .iter()
            .map(|u| (u.unit_id.as_str(), u.source_range.start, u.source_range.end))
            .collect()
    }

    #[test]
    fn subjects_run_to_next_bookmark() {
        let outline = vec![
            entry("Preface", 0),
            entry("A", 4),
            entry("Adams, Rachel", 4),
            entry("Arnoldy, Sister Mary Nicholas", 7),
            entry("B", 9),
            entry("Barnes, Mildred", 10),
        ];
        let units = plan_units(&outline, 14, 3);
        assert_eq!(
            ranges(&units),
            vec![
                ("adams_rachel", 4, 6),
                ("arnoldy_sister_mary_nicholas", 7, 8),
                ("barnes_mildred", 10, 13),
            ]
        );
        assert_eq!(units[0].title, "Adams, Rachel");
    }

    #[test]
    fn front_matter_and_letters_are_not_subjects() {
        let outline = vec![entry("Introduction", 1), entry(" Z ", 5), entry("Zorn, Ann", 6)];
        let units = plan_units(&outline, 8, 2);
        assert_eq!(ranges(&units), vec![("zorn_ann", 6, 7)]);
    }

    #[test]
    fn duplicate_names_get_suffixes() {
        let outline = vec![
            entry("Smith, Mary", 0),
            entry("Mary Smith", 2),
            entry("Smith, Mary", 4),
        ];
        let ids: Vec<String> = plan_units(&outline, 6, 0)
            .into_iter()
            .map(|u| u.unit_id.to_string())
            .collect();
        assert_eq!(ids, vec!["smith_mary", "smith_mary_2", "smith_mary_3"]);
    }

    #[test]
    fn unordered_outline_is_sorted_by_page() {
        let outline = vec![entry("Young, Grace", 8), entry("Adams, Rachel", 2)];
        let units = plan_units(&outline, 10, 0);
        assert_eq!(ranges(&units), vec![("adams_rachel", 2, 7), ("young_grace", 8, 9)]);
    }

    #[test]
    fn two_subjects_on_one_page_share_it() {
        let outline = vec![entry("Doe, Jane", 3), entry("Roe, Mary", 3), entry("Zed, Ann", 5)];
        let units = plan_units(&outline, 6, 0);
        assert_eq!(
            ranges(&units),
            vec![("doe_jane", 3, 4), ("roe_mary", 3, 4), ("zed_ann", 5, 5)]
        );
    }

    #[test]
    fn out_of_range_bookmarks_are_dropped() {
        let outline = vec![entry("Doe, Jane", 0), entry("Ghost, Page", 40)];
        let units = plan_units(&outline, 3, 0);
        assert_eq!(ranges(&units), vec![("doe_jane", 0, 2)]);
        assert!(plan_units(&outline, 0, 0).is_empty());
    }

    #[test]
    fn plan_serves_units_as_payloads() {
        let plan = SplitPlan::from_units(plan_units(&[entry("Doe, Jane", 1)], 3, 0));
        let id = UnitId::parse("doe_jane").unwrap();
        assert_eq!(plan.list_ids().unwrap().len(), 1);

        let unit: Unit = serde_json::from_slice(&plan.load(&id).unwrap()).unwrap();
        assert_eq!(unit.source_range, PageRange { start: 1, end: 2 });

        let missing = UnitId::parse("roe_mary").unwrap();
        assert!(matches!(plan.load(&missing), Err(StoreError::NotFound { .. })));
    }
}
