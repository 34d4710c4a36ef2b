#![forbid(unsafe_code)]
//! Volume metadata persistence.
//!
//! Volume definitions (name, capacity, QoS ceilings) live as one JSON blob
//! inside a fixed-size region on the meta volume. The blob is small and
//! rewritten whole on every change; the remainder of the region is kept
//! NUL-padded so a partially written or never-written region reads back as
//! "no volumes yet".

use karst_error::{KarstError, Result};
use karst_types::{trim_nul_padded, VolumeId};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Size of the on-device volume metadata region.
pub const VOLUME_META_REGION_SIZE: usize = 256 * 1024;

/// One host-visible volume definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub id: VolumeId,
    pub name: String,
    /// Provisioned capacity in bytes.
    pub total: u64,
    /// QoS ceiling: IOPS. 0 means unlimited.
    pub maxiops: u64,
    /// QoS ceiling: bandwidth in bytes/s. 0 means unlimited.
    pub maxbw: u64,
}

impl VolumeRecord {
    /// Whether this record may be persisted. Deleted volumes keep their
    /// slot with an empty name and are filtered out on save.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VolumeManifest {
    volumes: Vec<VolumeRecord>,
}

/// Whole-blob reader/writer for the volume metadata region.
#[derive(Debug, Clone)]
pub struct VolumeMetaStore {
    path: PathBuf,
    region_size: usize,
}

impl VolumeMetaStore {
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self::with_region_size(path, VOLUME_META_REGION_SIZE)
    }

    /// Test seam: shrink the region to exercise the overflow path.
    #[must_use]
    pub fn with_region_size(path: &Path, region_size: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            region_size,
        }
    }

    /// Persist the valid subset of `volumes`, rewriting the whole region.
    ///
    /// Fails with `MetaRegionOverflow` (region untouched) if the serialized
    /// blob would not fit.
    pub fn save_volumes(&self, volumes: &[VolumeRecord]) -> Result<()> {
        let manifest = VolumeManifest {
            volumes: volumes
                .iter()
                .filter(|volume| volume.is_valid())
                .cloned()
                .collect(),
        };

        let contents = if manifest.volumes.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&manifest)
                .map_err(|error| KarstError::MetaContentBroken(error.to_string()))?
        };

        if contents.len() >= self.region_size {
            return Err(KarstError::MetaRegionOverflow {
                needed: contents.len(),
                capacity: self.region_size,
            });
        }

        let mut region = vec![0_u8; self.region_size];
        region[..contents.len()].copy_from_slice(contents.as_bytes());

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(&region)?;
        file.sync_all()?;

        tracing::debug!(
            target: "karst::meta::volume",
            event = "volume_meta_saved",
            volumes = manifest.volumes.len(),
            bytes = contents.len(),
        );
        Ok(())
    }

    /// Read back all persisted volume definitions.
    ///
    /// A region of NULs (never written, or written with zero volumes) loads
    /// as an empty list. Unparsable content is `MetaContentBroken`.
    pub fn load_volumes(&self) -> Result<Vec<VolumeRecord>> {
        let region = std::fs::read(&self.path)?;
        let contents = trim_nul_padded(&region[..region.len().min(self.region_size)]);
        if contents.is_empty() {
            return Ok(Vec::new());
        }

        let manifest: VolumeManifest = serde_json::from_str(&contents).map_err(|error| {
            tracing::error!(
                target: "karst::meta::volume",
                event = "volume_meta_broken",
                error = %error,
            );
            KarstError::MetaContentBroken(error.to_string())
        })?;

        tracing::debug!(
            target: "karst::meta::volume",
            event = "volume_meta_loaded",
            volumes = manifest.volumes.len(),
        );
        Ok(manifest.volumes)
    }
}
