//! Region partitions: the index sets over which local alignments are learned.

use crate::error::AlignmentError;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Position of a region within its partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionId(pub usize);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How regions relate to each other.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionMode {
    /// Overlapping spheres around center voxels; predictions are combined per voxel.
    #[default]
    Searchlight,
    /// Disjoint parcels covering every voxel exactly once.
    Parcel,
}

impl fmt::Display for PartitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionMode::Searchlight => f.write_str("searchlight"),
            PartitionMode::Parcel => f.write_str("parcel"),
        }
    }
}

impl FromStr for PartitionMode {
    type Err = AlignmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "searchlight" => Ok(PartitionMode::Searchlight),
            "parcel" | "parcellation" => Ok(PartitionMode::Parcel),
            other => Err(AlignmentError::InvalidInput(format!("unknown partition mode '{}'", other))),
        }
    }
}

/// Ordered, duplicate-free voxel indices, with the searchlight geometry if any.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Region {
    voxels: Vec<usize>,
    center: Option<usize>,
    distances: Option<Vec<f64>>,
}

impl Region {
    pub fn new(voxels: Vec<usize>) -> Result<Self, AlignmentError> {
        if voxels.is_empty() {
            return Err(AlignmentError::InvalidInput("regions must contain at least one voxel".to_string()));
        }
        let mut sorted = voxels.clone();
        sorted.sort_unstable();
        if let Some(pair) = sorted.windows(2).find(|w| w[0] == w[1]) {
            return Err(AlignmentError::InvalidInput(format!("voxel {} listed twice in one region", pair[0])));
        }
        Ok(Self {
            voxels,
            center: None,
            distances: None,
        })
    }

    /// Searchlight region; `distances[k]` is the distance of `voxels[k]` from the center.
    /// The center is the closest voxel.
    pub fn searchlight(voxels: Vec<usize>, distances: Vec<f64>) -> Result<Self, AlignmentError> {
        let mut region = Self::new(voxels)?;
        if distances.len() != region.voxels.len() {
            return Err(AlignmentError::shape("searchlight distance count", region.voxels.len(), distances.len()));
        }
        if distances.iter().any(|d| !(d.is_finite() && *d >= 0.0)) {
            return Err(AlignmentError::InvalidInput(
                "searchlight distances must be finite and non-negative".to_string(),
            ));
        }
        let closest = distances
            .iter()
            .enumerate()
            .fold(0, |best, (k, d)| if *d < distances[best] { k } else { best });
        region.center = Some(region.voxels[closest]);
        region.distances = Some(distances);
        Ok(region)
    }

    pub fn voxels(&self) -> &[usize] {
        &self.voxels
    }

    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    pub fn center(&self) -> Option<usize> {
        self.center
    }

    pub fn distances(&self) -> Option<&[f64]> {
        self.distances.as_deref()
    }
}

/// An ordered sequence of regions over `n_voxels` voxels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionPartition {
    mode: PartitionMode,
    regions: Vec<Region>,
    n_voxels: usize,
    radius: Option<f64>,
}

impl RegionPartition {
    /// Disjoint parcels that together cover `0..n_voxels` exactly once.
    pub fn parcels(parcels: Vec<Vec<usize>>, n_voxels: usize) -> Result<Self, AlignmentError> {
        let regions = parcels.into_iter().map(Region::new).collect::<Result<Vec<_>, _>>()?;
        let partition = Self {
            mode: PartitionMode::Parcel,
            regions,
            n_voxels,
            radius: None,
        };
        partition.validate()?;
        Ok(partition)
    }

    /// Searchlights that together cover every voxel at least once.
    ///
    /// With `distances`, overlapping predictions are weighted by
    /// `(radius - d) / radius`; without them overlaps are averaged uniformly.
    pub fn searchlights(
        searchlights: Vec<Vec<usize>>,
        distances: Option<Vec<Vec<f64>>>,
        radius: Option<f64>,
        n_voxels: usize,
    ) -> Result<Self, AlignmentError> {
        let regions = match distances {
            Some(distances) => {
                if distances.len() != searchlights.len() {
                    return Err(AlignmentError::shape(
                        "searchlight distance lists",
                        searchlights.len(),
                        distances.len(),
                    ));
                }
                searchlights
                    .into_iter()
                    .zip(distances)
                    .map(|(voxels, d)| Region::searchlight(voxels, d))
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => searchlights.into_iter().map(Region::new).collect::<Result<Vec<_>, _>>()?,
        };
        if let Some(r) = radius {
            if !(r.is_finite() && r > 0.0) {
                return Err(AlignmentError::InvalidInput(format!("searchlight radius must be positive, got {}", r)));
            }
        }
        let partition = Self {
            mode: PartitionMode::Searchlight,
            regions,
            n_voxels,
            radius,
        };
        partition.validate()?;
        Ok(partition)
    }

    fn validate(&self) -> Result<(), AlignmentError> {
        if self.regions.is_empty() {
            return Err(AlignmentError::InvalidInput("a partition needs at least one region".to_string()));
        }
        let coverage = self.coverage()?;
        for (voxel, &count) in coverage.iter().enumerate() {
            match (self.mode, count) {
                (_, 0) => {
                    return Err(AlignmentError::InvalidInput(format!(
                        "voxel {} is not covered by any {}",
                        voxel, self.mode
                    )))
                }
                (PartitionMode::Parcel, c) if c > 1 => {
                    return Err(AlignmentError::InvalidInput(format!(
                        "voxel {} belongs to {} parcels",
                        voxel, c
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Number of regions containing each voxel.
    pub fn coverage(&self) -> Result<Vec<usize>, AlignmentError> {
        let mut counts = vec![0usize; self.n_voxels];
        for (index, region) in self.regions.iter().enumerate() {
            for &voxel in region.voxels() {
                let slot = counts.get_mut(voxel).ok_or_else(|| {
                    AlignmentError::InvalidInput(format!(
                        "region {} references voxel {} outside 0..{}",
                        index, voxel, self.n_voxels
                    ))
                })?;
                *slot += 1;
            }
        }
        Ok(counts)
    }

    pub fn mode(&self) -> PartitionMode {
        self.mode
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn n_voxels(&self) -> usize {
        self.n_voxels
    }

    pub fn radius(&self) -> Option<f64> {
        self.radius
    }

    /// Identifies the partition in cache keys.
    ///
    /// Mode and region count keep the key readable; the digest covers the voxel
    /// count, radius and every region's voxels and distances, so two partitions
    /// only share records when their contents are identical.
    pub fn key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.mode.to_string().as_bytes());
        hasher.update((self.n_voxels as u64).to_le_bytes());
        match self.radius {
            Some(r) => {
                hasher.update([1u8]);
                hasher.update(r.to_bits().to_le_bytes());
            }
            None => hasher.update([0u8]),
        }
        for region in &self.regions {
            hasher.update((region.len() as u64).to_le_bytes());
            for &voxel in region.voxels() {
                hasher.update((voxel as u64).to_le_bytes());
            }
            match region.distances() {
                Some(distances) => {
                    hasher.update([1u8]);
                    for d in distances {
                        hasher.update(d.to_bits().to_le_bytes());
                    }
                }
                None => hasher.update([0u8]),
            }
        }
        let digest = hasher.finalize();
        let fingerprint: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
        format!("{}-{}-{}", self.mode, self.regions.len(), fingerprint)
    }

    /// Aggregation weight of each voxel of `region`, in the region's voxel order.
    pub fn voxel_weights(&self, region: &Region) -> Array1<f64> {
        match (self.mode, self.radius, region.distances()) {
            (PartitionMode::Searchlight, Some(radius), Some(distances)) => distances
                .iter()
                .map(|d| ((radius - d) / radius).max(0.0))
                .collect(),
            _ => Array1::ones(region.len()),
        }
    }
}
