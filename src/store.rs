//! Per-unit, file-backed artifact storage.
//!
//! Every stage reads its inputs from one [`UnitStore`] and writes its outputs
//! to another. A store is a directory holding one payload file per unit
//! (`<unit_id>.pdf`, `.txt` or `.json`) plus a provenance sidecar under
//! `.provenance/<unit_id>.json`.
//!
//! ## Atomicity
//!
//! [`UnitStore::put`] removes the old sidecar, renames a fully written temp
//! payload into place, then renames a fully written temp sidecar into place.
//! Readers only consider units whose sidecar exists, and the sidecar records
//! the payload's SHA-256, so an interrupted write is either invisible or
//! detected as [`StoreError::Corrupt`]. It is never returned as valid.

use crate::error::StoreError;
use crate::record::BiographyRecord;
use crate::unit::UnitId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

const PROVENANCE_DIR: &str = ".provenance";

/// SHA-256 of a payload as lowercase hex.
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// What a store holds. Determines the file extension and the structural
/// check applied on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactKind {
    Pdf,
    Text,
    Record,
}

impl ArtifactKind {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Pdf => "pdf",
            ArtifactKind::Text => "txt",
            ArtifactKind::Record => "json",
        }
    }

    /// Structural validity of a payload of this kind.
    pub fn validate(&self, payload: &[u8]) -> Result<(), String> {
        match self {
            ArtifactKind::Pdf => {
                if payload.len() >= 4 && &payload[..4] == b"%PDF" {
                    Ok(())
                } else {
                    Err("missing %PDF header".into())
                }
            }
            ArtifactKind::Text => std::str::from_utf8(payload)
                .map(|_| ())
                .map_err(|e| format!("not UTF-8: {e}")),
            ArtifactKind::Record => BiographyRecord::from_slice(payload).map(|_| ()),
        }
    }
}

/// Where an artifact came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Revision of the transform logic that produced the artifact.
    pub code_version: String,
    pub produced_at: DateTime<Utc>,
    /// Fingerprint of the upstream payload this artifact was produced from.
    pub input_fingerprint: String,
    /// Fingerprint of the payload itself, checked on every read.
    pub payload_digest: String,
    pub payload_len: u64,
}

/// The output of one stage for one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageArtifact {
    pub unit_id: UnitId,
    pub payload: Vec<u8>,
    pub provenance: Provenance,
}

/// Anything a stage can read units from.
///
/// [`UnitStore`] is the usual source; the split stage reads from its outline
/// plan instead.
pub trait UnitSource: Send + Sync {
    /// All unit ids available, in iteration order.
    fn list_ids(&self) -> Result<BTreeSet<UnitId>, StoreError>;

    /// The payload for one unit.
    fn load(&self, unit_id: &UnitId) -> Result<Vec<u8>, StoreError>;
}

/// A directory of per-unit artifacts of one [`ArtifactKind`].
#[derive(Debug, Clone)]
pub struct UnitStore {
    dir: PathBuf,
    kind: ArtifactKind,
}

impl UnitStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>, kind: ArtifactKind) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        let prov = dir.join(PROVENANCE_DIR);
        std::fs::create_dir_all(&prov).map_err(|e| StoreError::io(&prov, e))?;
        Ok(Self { dir, kind })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn payload_path(&self, unit_id: &UnitId) -> PathBuf {
        self.dir
            .join(format!("{}.{}", unit_id, self.kind.extension()))
    }

    fn provenance_path(&self, unit_id: &UnitId) -> PathBuf {
        self.dir.join(PROVENANCE_DIR).join(format!("{unit_id}.json"))
    }

    /// True when a complete artifact exists. Does not verify its contents.
    pub fn has(&self, unit_id: &UnitId) -> bool {
        self.provenance_path(unit_id).is_file() && self.payload_path(unit_id).is_file()
    }

    /// Read and verify an artifact.
    pub fn get(&self, unit_id: &UnitId) -> Result<StageArtifact, StoreError> {
        let prov_path = self.provenance_path(unit_id);
        let prov_bytes = match std::fs::read(&prov_path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    unit_id: unit_id.to_string(),
                })
            }
            Err(e) => return Err(StoreError::io(prov_path, e)),
        };
        let corrupt = |detail: String| StoreError::Corrupt {
            unit_id: unit_id.to_string(),
            detail,
        };

        let provenance: Provenance = serde_json::from_slice(&prov_bytes)
            .map_err(|e| corrupt(format!("unreadable provenance: {e}")))?;

        let payload_path = self.payload_path(unit_id);
        let payload = match std::fs::read(&payload_path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(corrupt("provenance without payload".into()))
            }
            Err(e) => return Err(StoreError::io(payload_path, e)),
        };

        if fingerprint(&payload) != provenance.payload_digest {
            return Err(corrupt("payload digest mismatch".into()));
        }
        self.kind.validate(&payload).map_err(corrupt)?;

        Ok(StageArtifact {
            unit_id: unit_id.clone(),
            payload,
            provenance,
        })
    }

    /// Atomically replace the artifact for `unit_id`.
    pub fn put(
        &self,
        unit_id: &UnitId,
        payload: &[u8],
        code_version: &str,
        input_fingerprint: &str,
    ) -> Result<Provenance, StoreError> {
        let prov_path = self.provenance_path(unit_id);
        match std::fs::remove_file(&prov_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(prov_path, e)),
        }

        let payload_path = self.payload_path(unit_id);
        write_atomic(&self.dir, &payload_path, payload)?;

        let provenance = Provenance {
            code_version: code_version.to_string(),
            produced_at: Utc::now(),
            input_fingerprint: input_fingerprint.to_string(),
            payload_digest: fingerprint(payload),
            payload_len: payload.len() as u64,
        };
        let prov_bytes = serde_json::to_vec_pretty(&provenance)
            .map_err(|e| StoreError::io(&prov_path, e.into()))?;
        write_atomic(&self.dir.join(PROVENANCE_DIR), &prov_path, &prov_bytes)?;

        debug!("Stored {} ({} bytes) in {}", unit_id, payload.len(), self.dir.display());
        Ok(provenance)
    }

    /// Ids of all units with a provenance sidecar, whether or not the
    /// artifact turns out to be valid.
    pub fn list_ids(&self) -> Result<BTreeSet<UnitId>, StoreError> {
        let prov_dir = self.dir.join(PROVENANCE_DIR);
        let entries = match std::fs::read_dir(&prov_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(StoreError::io(prov_dir, e)),
        };

        let mut ids = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&prov_dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(UnitId::parse)
            {
                ids.insert(id);
            }
        }
        Ok(ids)
    }

    /// Ids whose artifact is readable and was produced by `code_version`.
    pub fn current_ids(&self, code_version: &str) -> Result<BTreeSet<UnitId>, StoreError> {
        Ok(self
            .list_ids()?
            .into_iter()
            .filter(|id| {
                matches!(self.get(id), Ok(a) if a.provenance.code_version == code_version)
            })
            .collect())
    }
}

impl UnitSource for UnitStore {
    fn list_ids(&self) -> Result<BTreeSet<UnitId>, StoreError> {
        UnitStore::list_ids(self)
    }

    fn load(&self, unit_id: &UnitId) -> Result<Vec<u8>, StoreError> {
        self.get(unit_id).map(|a| a.payload)
    }
}

/// A store seen through one code version: only artifacts that version
/// produced are listed or loaded.
///
/// Downstream stages read their upstream this way, so a unit whose upstream
/// artifact is stale is not picked up until the upstream stage reprocesses it.
#[derive(Debug, Clone)]
pub struct CurrentArtifacts {
    store: UnitStore,
    code_version: String,
}

impl CurrentArtifacts {
    pub fn new(store: UnitStore, code_version: impl Into<String>) -> Self {
        Self {
            store,
            code_version: code_version.into(),
        }
    }

    pub fn store(&self) -> &UnitStore {
        &self.store
    }

    pub fn code_version(&self) -> &str {
        &self.code_version
    }
}

impl UnitSource for CurrentArtifacts {
    fn list_ids(&self) -> Result<BTreeSet<UnitId>, StoreError> {
        self.store.current_ids(&self.code_version)
    }

    fn load(&self, unit_id: &UnitId) -> Result<Vec<u8>, StoreError> {
        let artifact = self.store.get(unit_id)?;
        if artifact.provenance.code_version != self.code_version {
            return Err(StoreError::Corrupt {
                unit_id: unit_id.to_string(),
                detail: format!(
                    "stale artifact ({} != {})",
                    artifact.provenance.code_version, self.code_version
                ),
            });
        }
        Ok(artifact.payload)
    }
}

/// Write `bytes` to a temp file in `dir`, then rename it over `dest`.
pub(crate) fn write_atomic(dir: &Path, dest: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| StoreError::io(dest, e))?;
    tmp.as_file().sync_all().map_err(|e| StoreError::io(dest, e))?;
    tmp.persist(dest).map_err(|e| StoreError::io(dest, e.error))?;
    Ok(())
}
