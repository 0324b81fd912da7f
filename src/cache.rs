//! Durable per-region storage of fitted estimators.
//!
//! Records are keyed by `(partition key, region index)`. Every region is written
//! by exactly one worker, so directory stores need no locking; each record is a
//! standalone bincode file.

use crate::alignment::AlignmentEstimator;
use crate::error::AlignmentError;
use crate::regions::RegionId;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// Where region fits are kept.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLocation {
    Directory(PathBuf),
    Memory,
}

impl Default for CacheLocation {
    fn default() -> Self {
        CacheLocation::Directory(PathBuf::from("cache"))
    }
}

/// The estimators learned for one region.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RegionModel {
    /// Source to target mapping learned by pairwise alignment.
    Pairwise(AlignmentEstimator),
    /// Per-subject mappings into and out of the region template.
    Shared {
        to_template: Vec<AlignmentEstimator>,
        from_template: Vec<AlignmentEstimator>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionFit {
    pub region: RegionId,
    pub model: RegionModel,
}

pub enum RegionFitCache {
    Directory(PathBuf),
    Memory(RwLock<HashMap<(String, RegionId), RegionFit>>),
}

impl RegionFitCache {
    pub fn new(location: &CacheLocation) -> Self {
        match location {
            CacheLocation::Directory(path) => RegionFitCache::Directory(path.clone()),
            CacheLocation::Memory => RegionFitCache::Memory(RwLock::new(HashMap::new())),
        }
    }

    /// Directory holding the records, if this is a directory store.
    pub fn directory(&self) -> Option<&Path> {
        match self {
            RegionFitCache::Directory(path) => Some(path),
            RegionFitCache::Memory(_) => None,
        }
    }

    /// File backing `(partition, region)` in a directory store.
    pub fn entry_path(&self, partition: &str, region: RegionId) -> Option<PathBuf> {
        self.directory()
            .map(|dir| dir.join(format!("{}_region_{:06}.bin", partition, region.0)))
    }

    /// Creates the storage directory if it does not exist.
    pub fn prepare(&self) -> Result<(), AlignmentError> {
        if let RegionFitCache::Directory(path) = self {
            fs::create_dir_all(path).map_err(|source| AlignmentError::CacheIo {
                path: path.clone(),
                source,
            })?;
            debug!("Region cache ready at {:?}", path);
        }
        Ok(())
    }

    /// Writes (or overwrites) the record for `fit.region`.
    pub fn store(&self, partition: &str, fit: &RegionFit) -> Result<(), AlignmentError> {
        match self {
            RegionFitCache::Directory(_) => {
                let path = self.require_path(partition, fit.region)?;
                let staging = path.with_extension("bin.partial");
                let io_error = |source| AlignmentError::CacheIo {
                    path: staging.clone(),
                    source,
                };
                let file = File::create(&staging).map_err(io_error)?;
                let mut writer = BufWriter::new(file);
                bincode::serde::encode_into_std_write(fit, &mut writer, bincode::config::standard())
                    .map_err(|e| AlignmentError::CacheCodec(format!("encoding region {}: {}", fit.region, e)))?;
                writer.flush().map_err(io_error)?;
                drop(writer);
                fs::rename(&staging, &path).map_err(|source| AlignmentError::CacheIo {
                    path: path.clone(),
                    source,
                })?;
                trace!("Stored region {} at {:?}", fit.region, path);
            }
            RegionFitCache::Memory(entries) => {
                entries
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert((partition.to_string(), fit.region), fit.clone());
            }
        }
        Ok(())
    }

    /// Reads the record for `(partition, region)`.
    pub fn load(&self, partition: &str, region: RegionId) -> Result<RegionFit, AlignmentError> {
        let missing = || AlignmentError::MissingCacheEntry {
            partition: partition.to_string(),
            region: region.0,
        };
        match self {
            RegionFitCache::Directory(_) => {
                let path = self.require_path(partition, region)?;
                let file = match File::open(&path) {
                    Ok(file) => file,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(missing()),
                    Err(source) => return Err(AlignmentError::CacheIo { path, source }),
                };
                let mut reader = BufReader::new(file);
                let fit: RegionFit = bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
                    .map_err(|e| AlignmentError::CacheCodec(format!("decoding {:?}: {}", path, e)))?;
                if fit.region != region {
                    return Err(AlignmentError::CacheCodec(format!(
                        "{:?} holds region {} instead of {}",
                        path, fit.region, region
                    )));
                }
                Ok(fit)
            }
            RegionFitCache::Memory(entries) => entries
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&(partition.to_string(), region))
                .cloned()
                .ok_or_else(missing),
        }
    }

    pub fn contains(&self, partition: &str, region: RegionId) -> bool {
        match self {
            RegionFitCache::Directory(_) => self
                .entry_path(partition, region)
                .is_some_and(|path| path.is_file()),
            RegionFitCache::Memory(entries) => entries
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(&(partition.to_string(), region)),
        }
    }

    /// Drops the record for `(partition, region)` if present.
    pub fn remove(&self, partition: &str, region: RegionId) -> Result<(), AlignmentError> {
        match self {
            RegionFitCache::Directory(_) => {
                let path = self.require_path(partition, region)?;
                match fs::remove_file(&path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(source) => Err(AlignmentError::CacheIo { path, source }),
                }
            }
            RegionFitCache::Memory(entries) => {
                entries
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&(partition.to_string(), region));
                Ok(())
            }
        }
    }

    fn require_path(&self, partition: &str, region: RegionId) -> Result<PathBuf, AlignmentError> {
        self.entry_path(partition, region)
            .ok_or_else(|| AlignmentError::InvalidInput("in-memory cache has no entry paths".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::{Alignment, AlignmentMethod};
    use ndarray::array;
    use tempfile::tempdir;

    fn fitted_region(region: usize) -> RegionFit {
        let mut estimator = AlignmentMethod::ScaledOrthogonal {
            scaling: true,
            primal: None,
        }
        .build();
        let x = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let y = array![[0.0, 2.0], [-2.0, 0.0], [-2.0, 2.0]];
        estimator.fit(x.view(), y.view()).unwrap();
        RegionFit {
            region: RegionId(region),
            model: RegionModel::Pairwise(estimator),
        }
    }

    #[test]
    fn directory_store_round_trips_estimators() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("fits");
        let cache = RegionFitCache::new(&CacheLocation::Directory(root.clone()));
        cache.prepare().unwrap();
        assert!(root.is_dir());

        let fit = fitted_region(7);
        assert!(!cache.contains("parcel-10", RegionId(7)));
        cache.store("parcel-10", &fit).unwrap();
        assert!(cache.contains("parcel-10", RegionId(7)));
        assert!(root.join("parcel-10_region_000007.bin").is_file());

        let loaded = cache.load("parcel-10", RegionId(7)).unwrap();
        let probe = array![[3.0, -1.0]];
        let (RegionModel::Pairwise(a), RegionModel::Pairwise(b)) = (&fit.model, &loaded.model) else {
            panic!("unexpected region model");
        };
        assert_eq!(a.transform(probe.view()).unwrap(), b.transform(probe.view()).unwrap());
    }

    #[test]
    fn missing_records_are_reported() {
        let dir = tempdir().unwrap();
        let cache = RegionFitCache::new(&CacheLocation::Directory(dir.path().to_path_buf()));
        cache.prepare().unwrap();
        match cache.load("searchlight-3", RegionId(2)) {
            Err(AlignmentError::MissingCacheEntry { partition, region }) => {
                assert_eq!(partition, "searchlight-3");
                assert_eq!(region, 2);
            }
            other => panic!("expected a missing entry, got {:?}", other.map(|f| f.region)),
        }

        let memory = RegionFitCache::new(&CacheLocation::Memory);
        assert!(matches!(
            memory.load("searchlight-3", RegionId(0)),
            Err(AlignmentError::MissingCacheEntry { .. })
        ));
        memory.store("searchlight-3", &fitted_region(0)).unwrap();
        assert!(memory.contains("searchlight-3", RegionId(0)));
        memory.remove("searchlight-3", RegionId(0)).unwrap();
        assert!(!memory.contains("searchlight-3", RegionId(0)));
    }
}
