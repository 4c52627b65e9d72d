//! The pluggable feature-classifier contract and candidate grouping.
//!
//! A classifier stage locates raw candidate regions for one feature kind
//! (face, eye, mouth) inside a search window. Raw candidates from a real
//! model are noisy and overlapping; the pipeline clusters them and keeps
//! only clusters with enough mutual agreement (`min_neighbors`) and a
//! large enough averaged box (`min_size`), which is what rejects spurious
//! small detections.

use crate::error::DetectError;
use crate::preprocess::LumaPlane;
use crate::region::Region;

/// Position/size tolerance when clustering raw candidates.
const GROUP_EPS: f64 = 0.2;

/// Per-stage acceptance thresholds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassifierParams {
    /// Minimum number of raw candidates that must agree on a region.
    pub min_neighbors: u32,
    /// Minimum (width, height) of an accepted region, in pixels.
    pub min_size: (u32, u32),
}

impl ClassifierParams {
    pub fn new(min_neighbors: u32, min_size: (u32, u32)) -> Self {
        Self {
            min_neighbors,
            min_size,
        }
    }
}

/// A single feature-classifier stage.
///
/// Contract: given an equalized luma plane and a search window (in plane
/// coordinates), return every raw candidate region the model proposes,
/// also in plane coordinates. Implementations hold only once-initialized,
/// read-only model resources; `locate` must be safe to call concurrently
/// from different sessions.
pub trait FeatureClassifier: Send + Sync {
    fn locate(&self, plane: &LumaPlane, window: Region) -> Result<Vec<Region>, DetectError>;
}

/// Cluster raw candidates and apply the stage thresholds.
///
/// Candidates are grouped by rectangle similarity (union-find over the
/// `similar` predicate); each surviving group is averaged into one region.
pub fn group_candidates(raw: &[Region], params: &ClassifierParams) -> Vec<Region> {
    if raw.is_empty() {
        return Vec::new();
    }

    // Union-find over pairwise similarity.
    let mut parent: Vec<usize> = (0..raw.len()).collect();
    fn find(parent: &mut [usize], i: usize) -> usize {
        let mut root = i;
        while parent[root] != root {
            root = parent[root];
        }
        let mut cur = i;
        while parent[cur] != root {
            let next = parent[cur];
            parent[cur] = root;
            cur = next;
        }
        root
    }
    for i in 0..raw.len() {
        for j in (i + 1)..raw.len() {
            if raw[i].similar(&raw[j], GROUP_EPS) {
                let ri = find(&mut parent, i);
                let rj = find(&mut parent, j);
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    // Accumulate (count, sums) per cluster root.
    let mut clusters: Vec<(usize, [i64; 4])> = Vec::new();
    let mut root_index: Vec<Option<usize>> = vec![None; raw.len()];
    for i in 0..raw.len() {
        let root = find(&mut parent, i);
        let slot = match root_index[root] {
            Some(slot) => slot,
            None => {
                clusters.push((0, [0; 4]));
                root_index[root] = Some(clusters.len() - 1);
                clusters.len() - 1
            }
        };
        let r = &raw[i];
        let (count, sums) = &mut clusters[slot];
        *count += 1;
        sums[0] += r.x as i64;
        sums[1] += r.y as i64;
        sums[2] += r.width as i64;
        sums[3] += r.height as i64;
    }

    let (min_w, min_h) = params.min_size;
    clusters
        .into_iter()
        .filter(|(count, _)| *count as u32 >= params.min_neighbors.max(1))
        .map(|(count, sums)| {
            let n = count as i64;
            Region::new(
                (sums[0] / n) as i32,
                (sums[1] / n) as i32,
                (sums[2] / n) as i32,
                (sums[3] / n) as i32,
            )
        })
        .filter(|r| r.width >= min_w as i32 && r.height >= min_h as i32)
        .collect()
}
