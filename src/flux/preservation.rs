use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::task;

use crate::error::{RecoveryError, Result};
use crate::types::{FluxSample, Revolution, TrackId};

const STORE_VERSION: u32 = 1;

/// Identity of one preserved revolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub track: u16,
    pub head: u8,
    pub revolution: u16,
}

impl SnapshotKey {
    pub fn new(track: TrackId, revolution: u16) -> Self {
        Self {
            track: track.track,
            head: track.head,
            revolution,
        }
    }
}

impl std::fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}.{}/rev{}", self.track, self.head, self.revolution)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluxSnapshot {
    pub samples: Vec<FluxSample>,
    pub index_time_ns: u64,
    pub quality: f32,
    pub checksum: String,
    pub captured_at: DateTime<Utc>,
}

/// SHA-256 over a canonical little-endian encoding of the samples
pub fn compute_checksum(samples: &[FluxSample]) -> String {
    let mut hasher = Sha256::new();
    hasher.update((samples.len() as u64).to_le_bytes());
    for sample in samples {
        hasher.update(sample.timestamp_ns.to_le_bytes());
        hasher.update([sample.confidence]);
        hasher.update(sample.revolution.to_le_bytes());
        hasher.update([sample.flags.bits()]);
    }
    format!("{:x}", hasher.finalize())
}

/// Write-once staging area; seal it to get the read-only store
#[derive(Debug, Default)]
pub struct PreservationStoreBuilder {
    snapshots: BTreeMap<SnapshotKey, FluxSnapshot>,
}

impl PreservationStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a revolution exactly as captured
    ///
    /// Preserving the same data twice is a no-op; different data under an
    /// existing key is refused.
    pub fn preserve(&mut self, track: TrackId, revolution: &Revolution) -> Result<SnapshotKey> {
        let key = SnapshotKey::new(track, revolution.index());
        let checksum = compute_checksum(revolution.samples());

        if let Some(existing) = self.snapshots.get(&key) {
            if existing.checksum == checksum {
                return Ok(key);
            }
            return Err(RecoveryError::InvalidInput(format!(
                "snapshot {} already preserved with different content",
                key
            )));
        }

        self.snapshots.insert(
            key,
            FluxSnapshot {
                samples: revolution.samples().to_vec(),
                index_time_ns: revolution.index_time_ns(),
                quality: revolution.quality(),
                checksum,
                captured_at: Utc::now(),
            },
        );
        Ok(key)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn seal(self) -> FluxPreservationStore {
        FluxPreservationStore {
            version: STORE_VERSION,
            created_at: Utc::now(),
            snapshots: Arc::new(self.snapshots),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    created_at: DateTime<Utc>,
    snapshots: Vec<(SnapshotKey, FluxSnapshot)>,
}

/// Read-only, shareable store of original flux
#[derive(Debug, Clone)]
pub struct FluxPreservationStore {
    version: u32,
    created_at: DateTime<Utc>,
    snapshots: Arc<BTreeMap<SnapshotKey, FluxSnapshot>>,
}

impl FluxPreservationStore {
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &SnapshotKey> {
        self.snapshots.keys()
    }

    pub fn snapshot(&self, key: &SnapshotKey) -> Option<&FluxSnapshot> {
        self.snapshots.get(key)
    }

    fn verify(key: &SnapshotKey, snapshot: &FluxSnapshot) -> Result<()> {
        let actual = compute_checksum(&snapshot.samples);
        if actual != snapshot.checksum {
            return Err(RecoveryError::Integrity {
                key: key.to_string(),
                expected: snapshot.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Verified, byte-identical copy of the preserved samples
    pub fn restore(&self, key: &SnapshotKey) -> Result<Vec<FluxSample>> {
        let snapshot = self
            .snapshots
            .get(key)
            .ok_or_else(|| RecoveryError::InvalidInput(format!("no snapshot {}", key)))?;
        Self::verify(key, snapshot)?;
        Ok(snapshot.samples.clone())
    }

    /// Rebuild the preserved revolution
    pub fn restore_revolution(&self, key: &SnapshotKey) -> Result<Revolution> {
        let samples = self.restore(key)?;
        let snapshot = &self.snapshots[key];
        Ok(Revolution::from_samples(key.revolution, samples, snapshot.index_time_ns)?
            .with_quality(snapshot.quality))
    }

    pub fn verify_all(&self) -> Result<usize> {
        for (key, snapshot) in self.snapshots.iter() {
            Self::verify(key, snapshot)?;
        }
        Ok(self.snapshots.len())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let file: StoreFile =
            serde_json::from_slice(&data).map_err(|err| RecoveryError::Parse(err.to_string()))?;
        if file.version != STORE_VERSION {
            return Err(RecoveryError::Parse(format!(
                "unsupported preservation store version {}",
                file.version
            )));
        }
        let store = Self {
            version: file.version,
            created_at: file.created_at,
            snapshots: Arc::new(file.snapshots.into_iter().collect()),
        };
        store.verify_all()?;
        Ok(store)
    }

    /// Write through a temporary file and rename, optionally keeping a `.bak`
    pub fn save_blocking(&self, path: &Path, backup: bool) -> Result<()> {
        let file = StoreFile {
            version: self.version,
            created_at: self.created_at,
            snapshots: self
                .snapshots
                .iter()
                .map(|(key, snapshot)| (*key, snapshot.clone()))
                .collect(),
        };
        let serialized =
            serde_json::to_vec(&file).map_err(|err| RecoveryError::Parse(err.to_string()))?;
        let tmp_path = path.with_extension("tmp");

        {
            let mut out = File::create(&tmp_path)?;
            out.write_all(&serialized)?;
            out.sync_all()?;
        }

        if backup && path.exists() {
            let backup_path = path.with_extension("bak");
            if let Err(err) = fs::copy(path, &backup_path) {
                log::warn!("could not back up {}: {}", path.display(), err);
            }
        }

        fs::rename(tmp_path, path)?;
        log::info!(
            "preserved {} revolutions to {}",
            self.snapshots.len(),
            path.display()
        );
        Ok(())
    }

    pub async fn save_atomic(&self, path: &Path, backup: bool) -> Result<()> {
        let path = path.to_path_buf();
        let store = self.clone();
        task::spawn_blocking(move || store.save_blocking(&path, backup))
            .await
            .map_err(|err| RecoveryError::Config(format!("Preservation task failed: {err}")))?
    }
}
