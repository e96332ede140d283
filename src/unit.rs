//! Units of work: one biographical subject per unit.
//!
//! A [`UnitId`] is derived once, at split time, from the subject's bookmark
//! title and is then used unchanged as the file stem in every stage and as the
//! foreign key in every joined table. Because the id is the only thing that
//! links a text file to a parsed record, normalisation must be deterministic:
//! the same title always yields the same id.

use serde::{Deserialize, Serialize};
use std::fmt;
use unicode_normalization::UnicodeNormalization;

/// Stable identifier of a subject, in `lastname_firstname` form.
///
/// Only ASCII `a-z`, `0-9` and `_` survive normalisation, so an id is always
/// a safe file stem and [`UnitId::parse`] accepts every id
/// [`UnitId::from_name`] produces. Accented letters are folded to their base
/// letter (`"Émilie"` → `emilie`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    /// Derive an id from a subject name.
    ///
    /// * `"Adams, Rachel"` → `adams_rachel` (catalogue order)
    /// * `"Rachel Adams"` → `adams_rachel` (natural order, last word is the surname)
    /// * `"Arnoldy, Sister Mary Nicholas"` → `arnoldy_sister_mary_nicholas`
    ///
    /// Returns `None` when nothing usable remains after normalisation.
    pub fn from_name(name: &str) -> Option<Self> {
        let parts = NameParts::parse(name);
        let id = words(&parts.last)
            .into_iter()
            .chain(words(&parts.first))
            .map(|w| normalise_word(&w))
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
            .join("_");

        if id.is_empty() {
            None
        } else {
            Some(UnitId(id))
        }
    }

    /// Accept an already-normalised id (e.g. a file stem read back from disk).
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && !raw.starts_with('_')
            && raw
                .chars()
                .all(|c| c == '_' || c.is_ascii_lowercase() || c.is_ascii_digit());
        valid.then(|| UnitId(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id without a collision suffix: `doe_jane_2` → `doe_jane`.
    pub fn base(&self) -> &str {
        match self.0.rsplit_once('_') {
            Some((head, tail))
                if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) =>
            {
                head
            }
            _ => &self.0,
        }
    }

    /// Surname part of the id (everything before the first `_`).
    pub fn last_name(&self) -> &str {
        let base = self.base();
        base.split_once('_').map(|(l, _)| l).unwrap_or(base)
    }

    /// Given-name part of the id, space separated. Empty for single-word ids.
    pub fn first_name(&self) -> String {
        self.base()
            .split_once('_')
            .map(|(_, rest)| rest.replace('_', " "))
            .unwrap_or_default()
    }

    /// Human-readable name reconstructed from the id: `"Rachel Adams"`.
    pub fn display_name(&self) -> String {
        let first = self.first_name();
        let parts = first
            .split(' ')
            .chain(std::iter::once(self.last_name()))
            .filter(|p| !p.is_empty())
            .map(capitalise)
            .collect::<Vec<_>>();
        parts.join(" ")
    }

    /// Derive a sibling id for a name collision: `doe_jane` → `doe_jane_2`.
    pub(crate) fn with_suffix(&self, n: usize) -> Self {
        UnitId(format!("{}_{}", self.0, n))
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UnitId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn words(s: &str) -> Vec<String> {
    s.split(|c: char| c.is_whitespace() || c == '-')
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fold a word to ASCII `a-z0-9`: decompose, drop the combining marks, then
/// spell out the few letters that have no decomposition.
fn normalise_word(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    for c in word.nfkd().flat_map(char::to_lowercase) {
        match c {
            'a'..='z' | '0'..='9' => out.push(c),
            'ß' => out.push_str("ss"),
            'æ' => out.push_str("ae"),
            'œ' => out.push_str("oe"),
            'þ' => out.push_str("th"),
            'ø' => out.push('o'),
            'ł' => out.push('l'),
            'đ' | 'ð' => out.push('d'),
            'ı' => out.push('i'),
            _ => {}
        }
    }
    out
}

fn capitalise(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// A personal name split into surname and given names, as written.
///
/// Catalogue order (`"Ball-Smith, J. Annie"`) splits on the first comma.
/// Natural order (`"Annie Ball-Smith"`) takes the last word as the surname,
/// so a hyphenated surname stays whole. Whitespace is collapsed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NameParts {
    pub last: String,
    pub first: String,
}

impl NameParts {
    pub fn parse(name: &str) -> Self {
        let collapse = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
        match name.split_once(',') {
            Some((last, first)) => NameParts {
                last: collapse(last),
                first: collapse(first),
            },
            None => {
                let mut parts: Vec<&str> = name.split_whitespace().collect();
                let last = parts.pop().unwrap_or_default().to_string();
                NameParts {
                    last,
                    first: parts.join(" "),
                }
            }
        }
    }
}

/// Inclusive, 0-based page span of a unit within the source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
}

impl PageRange {
    pub fn len(&self) -> usize {
        self.end + 1 - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// One subject: its id and where it lives in the source PDF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub unit_id: UnitId,
    pub title: String,
    pub source_range: PageRange,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_order_name() {
        let id = UnitId::from_name("Adams, Rachel").unwrap();
        assert_eq!(id.as_str(), "adams_rachel");
    }

    #[test]
    fn natural_order_name() {
        let id = UnitId::from_name("Rachel Adams").unwrap();
        assert_eq!(id.as_str(), "adams_rachel");
    }

    #[test]
    fn multi_word_given_names_and_punctuation() {
        let id = UnitId::from_name("Arnoldy, Sister Mary Nicholas (S.M.N.)").unwrap();
        assert_eq!(id.as_str(), "arnoldy_sister_mary_nicholas_smn");

        let id = UnitId::from_name("  Ball-Smith,  J. Annie ").unwrap();
        assert_eq!(id.as_str(), "ball_smith_j_annie");
    }

    #[test]
    fn same_title_same_id() {
        let a = UnitId::from_name("Noether, Emmy").unwrap();
        let b = UnitId::from_name("Noether, Emmy").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unusable_title_yields_none() {
        assert!(UnitId::from_name("").is_none());
        assert!(UnitId::from_name(" ,. ").is_none());
    }

    #[test]
    fn parse_rejects_unsafe_stems() {
        assert!(UnitId::parse("adams_rachel").is_some());
        assert!(UnitId::parse("Adams_rachel").is_none());
        assert!(UnitId::parse("../etc").is_none());
        assert!(UnitId::parse("").is_none());
        assert!(UnitId::parse("_hidden").is_none());
    }

    #[test]
    fn derived_name_parts() {
        let id = UnitId::parse("arnoldy_sister_mary").unwrap();
        assert_eq!(id.last_name(), "arnoldy");
        assert_eq!(id.first_name(), "sister mary");
        assert_eq!(id.display_name(), "Sister Mary Arnoldy");

        let single = UnitId::parse("hypatia").unwrap();
        assert_eq!(single.last_name(), "hypatia");
        assert_eq!(single.first_name(), "");
        assert_eq!(single.display_name(), "Hypatia");
    }

    #[test]
    fn accented_names_fold_to_ascii() {
        let cases = [
            ("Inan, İnci", "inan_inci"),
            ("Châtelet, Émilie du", "chatelet_emilie_du"),
            ("Sofia Kovalévskaya", "kovalevskaya_sofia"),
            ("Weiß, Łucja", "weiss_lucja"),
        ];
        for (title, expected) in cases {
            let id = UnitId::from_name(title).unwrap();
            assert_eq!(id.as_str(), expected, "title {title:?}");
            assert_eq!(UnitId::parse(id.as_str()), Some(id));
        }
    }

    #[test]
    fn parse_accepts_only_ascii() {
        assert!(UnitId::parse("inan_inci").is_some());
        assert!(UnitId::parse("doe_jane_2").is_some());
        assert!(UnitId::parse("i\u{307}nan").is_none());
        assert!(UnitId::parse("chatelet_émilie").is_none());
        assert!(UnitId::parse("doe-jane").is_none());
    }

    #[test]
    fn collision_suffix_is_not_a_given_name() {
        let id = UnitId::parse("smith_mary").unwrap().with_suffix(2);
        assert_eq!(id.as_str(), "smith_mary_2");
        assert_eq!(id.base(), "smith_mary");
        assert_eq!(id.last_name(), "smith");
        assert_eq!(id.first_name(), "mary");
        assert_eq!(id.display_name(), "Mary Smith");

        // A bare number is a whole id, not a suffix.
        assert_eq!(UnitId::parse("1900").unwrap().base(), "1900");
    }

    #[test]
    fn name_parts_keep_compound_surnames() {
        let natural = NameParts::parse("Annie  Ball-Smith");
        assert_eq!(natural.last, "Ball-Smith");
        assert_eq!(natural.first, "Annie");

        let catalogue = NameParts::parse(" du Châtelet,  Émilie ");
        assert_eq!(catalogue.last, "du Châtelet");
        assert_eq!(catalogue.first, "Émilie");

        assert_eq!(NameParts::parse("Hypatia").first, "");
    }

    #[test]
    fn page_range_len() {
        let r = PageRange { start: 4, end: 6 };
        assert_eq!(r.len(), 3);
        assert!(!r.is_empty());
    }
}
