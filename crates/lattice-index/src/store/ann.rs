//! Approximate-nearest-neighbor index backing vector search.
//!
//! Two index families: `graph` keeps a small-world neighbor list per entry
//! and searches it greedily from a fixed entry point; `partition` groups
//! entries into centroid buckets and probes the nearest few at query time.
//! Collections at or below [`EXACT_SCAN_LIMIT`] entries are scanned exactly
//! regardless of family, and a probe that comes up short of the requested
//! limit widens to an exact pass so filtered searches never lose matches.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Collections at or below this size are scanned exactly.
pub(crate) const EXACT_SCAN_LIMIT: usize = 256;

/// Beam width floor for graph-family searches.
const MIN_SEARCH_BEAM: usize = 64;

/// Lloyd iterations when (re)building partition centroids.
const LLOYD_ROUNDS: usize = 4;

/// Similarity metric for distances and score normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    L2,
    Dot,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::L2 => "l2",
            Self::Dot => "dot",
        }
    }

    /// Raw distance between two vectors. Lower is closer for every metric;
    /// dot product is negated so the ordering matches.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => {
                let denom = norm(a) * norm(b);
                if denom <= f32::EPSILON {
                    1.0
                } else {
                    1.0 - dot(a, b) / denom
                }
            }
            Metric::L2 => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
            Metric::Dot => -dot(a, b),
        }
    }

    /// Normalize a raw distance into a [0,1] relevance score. Cosine maps
    /// `1 − d` directly; L2 assumes unit vectors where `d² = 2 − 2·cos` and
    /// maps `1 − d²/2`; dot maps the recovered product through `(x+1)/2`.
    pub fn score(&self, distance: f32) -> f32 {
        let raw = match self {
            Metric::Cosine => 1.0 - distance,
            Metric::L2 => 1.0 - distance * distance / 2.0,
            Metric::Dot => (1.0 - distance) / 2.0,
        };
        raw.clamp(0.0, 1.0)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Index family and tuning parameters, part of store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "lowercase")]
pub enum IndexParams {
    /// Small-world neighbor graph; each insert links to its
    /// `construction_breadth` nearest entries.
    Graph { construction_breadth: usize },
    /// Centroid buckets; queries probe the `probe_count` nearest of
    /// `partition_count` partitions.
    Partition {
        partition_count: usize,
        probe_count: usize,
    },
}

impl Default for IndexParams {
    fn default() -> Self {
        IndexParams::Graph {
            construction_breadth: 16,
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    id: String,
    vector: Vec<f32>,
}

enum FamilyState {
    Graph {
        breadth: usize,
        neighbors: Vec<Vec<usize>>,
    },
    Partition {
        partition_count: usize,
        probe_count: usize,
        centroids: Vec<Vec<f32>>,
        buckets: Vec<Vec<usize>>,
        bucket_of: HashMap<usize, usize>,
        built_size: usize,
    },
}

/// In-memory ANN structure over (id, vector) entries. Rebuilt from
/// persisted chunk records on store load; not persisted itself.
pub struct AnnIndex {
    metric: Metric,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    by_id: HashMap<String, usize>,
    live: usize,
    family: FamilyState,
}

impl AnnIndex {
    pub fn new(metric: Metric, params: &IndexParams) -> Self {
        let family = match params {
            IndexParams::Graph {
                construction_breadth,
            } => FamilyState::Graph {
                breadth: (*construction_breadth).max(2),
                neighbors: Vec::new(),
            },
            IndexParams::Partition {
                partition_count,
                probe_count,
            } => FamilyState::Partition {
                partition_count: (*partition_count).max(1),
                probe_count: (*probe_count).max(1),
                centroids: Vec::new(),
                buckets: Vec::new(),
                bucket_of: HashMap::new(),
                built_size: 0,
            },
        };
        Self {
            metric,
            slots: Vec::new(),
            free: Vec::new(),
            by_id: HashMap::new(),
            live: 0,
            family,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Insert an entry, replacing any existing entry with the same id.
    pub fn insert(&mut self, id: &str, vector: Vec<f32>) {
        self.remove(id);

        let slot = match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(Slot {
                    id: id.to_string(),
                    vector,
                });
                i
            }
            None => {
                self.slots.push(Some(Slot {
                    id: id.to_string(),
                    vector,
                }));
                self.slots.len() - 1
            }
        };
        self.by_id.insert(id.to_string(), slot);
        self.live += 1;

        match &mut self.family {
            FamilyState::Graph { breadth, neighbors } => {
                neighbors.resize(self.slots.len(), Vec::new());
                let breadth = *breadth;
                let query = match &self.slots[slot] {
                    Some(s) => s.vector.clone(),
                    None => return,
                };
                let candidates = if self.live <= EXACT_SCAN_LIMIT {
                    Self::exact_candidates(&self.slots, self.metric, &query)
                } else {
                    let beam = (breadth * 4).max(MIN_SEARCH_BEAM);
                    Self::beam_candidates(&self.slots, self.metric, neighbors, &query, beam)
                };
                let cap = breadth * 2;
                for (other, _) in candidates
                    .into_iter()
                    .filter(|&(i, _)| i != slot)
                    .take(breadth)
                {
                    Self::link(&self.slots, self.metric, neighbors, slot, other, cap);
                }
            }
            FamilyState::Partition {
                partition_count,
                centroids,
                buckets,
                bucket_of,
                built_size,
                ..
            } => {
                if self.live <= EXACT_SCAN_LIMIT {
                    centroids.clear();
                    buckets.clear();
                    bucket_of.clear();
                    *built_size = 0;
                } else if centroids.is_empty() || self.live >= *built_size * 2 {
                    Self::build_partitions(
                        &self.slots,
                        self.metric,
                        *partition_count,
                        centroids,
                        buckets,
                        bucket_of,
                    );
                    *built_size = self.live;
                } else {
                    let vector = match &self.slots[slot] {
                        Some(s) => &s.vector,
                        None => return,
                    };
                    let bucket = Self::nearest_centroid(self.metric, centroids, vector);
                    buckets[bucket].push(slot);
                    bucket_of.insert(slot, bucket);
                }
            }
        }
    }

    /// Remove an entry by id. Returns whether it was present.
    pub fn remove(&mut self, id: &str) -> bool {
        let Some(slot) = self.by_id.remove(id) else {
            return false;
        };

        match &mut self.family {
            FamilyState::Graph { breadth, neighbors } => {
                let former = std::mem::take(&mut neighbors[slot]);
                for &n in &former {
                    neighbors[n].retain(|&x| x != slot);
                }
                // Relink the removed entry's neighborhood so the graph
                // stays connected across deletes.
                let cap = *breadth * 2;
                for i in 0..former.len() {
                    for j in (i + 1)..former.len() {
                        Self::link(
                            &self.slots,
                            self.metric,
                            neighbors,
                            former[i],
                            former[j],
                            cap,
                        );
                    }
                }
            }
            FamilyState::Partition {
                buckets, bucket_of, ..
            } => {
                if let Some(bucket) = bucket_of.remove(&slot) {
                    if let Some(members) = buckets.get_mut(bucket) {
                        members.retain(|&x| x != slot);
                    }
                }
            }
        }

        self.slots[slot] = None;
        self.free.push(slot);
        self.live -= 1;
        true
    }

    /// Nearest entries to `query` that pass `allow`, as (id, distance)
    /// pairs sorted by ascending distance with id as the tie-break.
    pub fn search<F>(&self, query: &[f32], limit: usize, allow: F) -> Vec<(String, f32)>
    where
        F: Fn(&str) -> bool,
    {
        if limit == 0 || self.live == 0 {
            return Vec::new();
        }

        let approximate = self.live > EXACT_SCAN_LIMIT;
        let candidates = if !approximate {
            Self::exact_candidates(&self.slots, self.metric, query)
        } else {
            match &self.family {
                FamilyState::Graph { neighbors, .. } => {
                    let beam = (limit * 4).max(MIN_SEARCH_BEAM);
                    Self::beam_candidates(&self.slots, self.metric, neighbors, query, beam)
                }
                FamilyState::Partition {
                    probe_count,
                    centroids,
                    buckets,
                    ..
                } => {
                    if centroids.is_empty() {
                        Self::exact_candidates(&self.slots, self.metric, query)
                    } else {
                        self.probe_candidates(centroids, buckets, *probe_count, query)
                    }
                }
            }
        };

        let mut hits = self.collect_hits(candidates, &allow);
        if approximate && hits.len() < limit {
            // A probe that misses filtered matches widens to an exact pass.
            let exact = Self::exact_candidates(&self.slots, self.metric, query);
            hits = self.collect_hits(exact, &allow);
        }

        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(limit);
        hits
    }

    fn collect_hits<F>(&self, candidates: Vec<(usize, f32)>, allow: &F) -> Vec<(String, f32)>
    where
        F: Fn(&str) -> bool,
    {
        candidates
            .into_iter()
            .filter_map(|(slot, dist)| {
                self.slots[slot]
                    .as_ref()
                    .filter(|s| allow(&s.id))
                    .map(|s| (s.id.clone(), dist))
            })
            .collect()
    }

    fn exact_candidates(
        slots: &[Option<Slot>],
        metric: Metric,
        query: &[f32],
    ) -> Vec<(usize, f32)> {
        let mut out: Vec<(usize, f32)> = slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                s.as_ref()
                    .map(|s| (i, metric.distance(query, &s.vector)))
            })
            .collect();
        out.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    /// Greedy best-first traversal from the first live entry, keeping a
    /// bounded result set of `beam` nearest visited entries.
    fn beam_candidates(
        slots: &[Option<Slot>],
        metric: Metric,
        neighbors: &[Vec<usize>],
        query: &[f32],
        beam: usize,
    ) -> Vec<(usize, f32)> {
        let Some(entry) = slots.iter().position(|s| s.is_some()) else {
            return Vec::new();
        };

        let mut visited: HashSet<usize> = HashSet::new();
        let mut frontier: BinaryHeap<Reverse<HeapEntry>> = BinaryHeap::new();
        let mut best: BinaryHeap<HeapEntry> = BinaryHeap::new();

        let d0 = match &slots[entry] {
            Some(s) => metric.distance(query, &s.vector),
            None => return Vec::new(),
        };
        visited.insert(entry);
        frontier.push(Reverse(HeapEntry {
            dist: d0,
            slot: entry,
        }));
        best.push(HeapEntry {
            dist: d0,
            slot: entry,
        });

        while let Some(Reverse(current)) = frontier.pop() {
            if best.len() >= beam {
                if let Some(worst) = best.peek() {
                    if current.dist > worst.dist {
                        break;
                    }
                }
            }
            for &n in neighbors.get(current.slot).map(Vec::as_slice).unwrap_or(&[]) {
                if !visited.insert(n) {
                    continue;
                }
                let Some(s) = slots.get(n).and_then(Option::as_ref) else {
                    continue;
                };
                let d = metric.distance(query, &s.vector);
                let admit = best.len() < beam
                    || best.peek().map(|w| d < w.dist).unwrap_or(true);
                if admit {
                    frontier.push(Reverse(HeapEntry { dist: d, slot: n }));
                    best.push(HeapEntry { dist: d, slot: n });
                    if best.len() > beam {
                        best.pop();
                    }
                }
            }
        }

        let mut out: Vec<(usize, f32)> =
            best.into_iter().map(|e| (e.slot, e.dist)).collect();
        out.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    fn probe_candidates(
        &self,
        centroids: &[Vec<f32>],
        buckets: &[Vec<usize>],
        probe_count: usize,
        query: &[f32],
    ) -> Vec<(usize, f32)> {
        let mut ranked: Vec<(usize, f32)> = centroids
            .iter()
            .enumerate()
            .map(|(b, c)| (b, self.metric.distance(query, c)))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut out = Vec::new();
        for &(bucket, _) in ranked.iter().take(probe_count) {
            for &slot in buckets.get(bucket).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(s) = self.slots.get(slot).and_then(Option::as_ref) {
                    out.push((slot, self.metric.distance(query, &s.vector)));
                }
            }
        }
        out.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    fn link(
        slots: &[Option<Slot>],
        metric: Metric,
        neighbors: &mut [Vec<usize>],
        a: usize,
        b: usize,
        cap: usize,
    ) {
        if a == b || slots[a].is_none() || slots[b].is_none() {
            return;
        }
        if !neighbors[a].contains(&b) {
            neighbors[a].push(b);
            Self::prune_list(slots, metric, &mut neighbors[a], a, cap);
        }
        if !neighbors[b].contains(&a) {
            neighbors[b].push(a);
            Self::prune_list(slots, metric, &mut neighbors[b], b, cap);
        }
    }

    /// Keep only the `cap` nearest neighbors, measured from `origin`.
    fn prune_list(
        slots: &[Option<Slot>],
        metric: Metric,
        list: &mut Vec<usize>,
        origin: usize,
        cap: usize,
    ) {
        if list.len() <= cap {
            return;
        }
        let Some(origin_vec) = slots[origin].as_ref().map(|s| &s.vector) else {
            return;
        };
        let mut ranked: Vec<(usize, f32)> = list
            .iter()
            .filter_map(|&n| {
                slots[n]
                    .as_ref()
                    .map(|s| (n, metric.distance(origin_vec, &s.vector)))
            })
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(cap);
        *list = ranked.into_iter().map(|(n, _)| n).collect();
    }

    fn nearest_centroid(metric: Metric, centroids: &[Vec<f32>], vector: &[f32]) -> usize {
        let mut best = 0;
        let mut best_dist = f32::INFINITY;
        for (b, c) in centroids.iter().enumerate() {
            let d = metric.distance(vector, c);
            if d < best_dist {
                best = b;
                best_dist = d;
            }
        }
        best
    }

    /// Seed centroids from evenly spaced live entries so builds are
    /// deterministic, then refine with a few Lloyd rounds.
    fn build_partitions(
        slots: &[Option<Slot>],
        metric: Metric,
        partition_count: usize,
        centroids: &mut Vec<Vec<f32>>,
        buckets: &mut Vec<Vec<usize>>,
        bucket_of: &mut HashMap<usize, usize>,
    ) {
        centroids.clear();
        buckets.clear();
        bucket_of.clear();

        let live: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect();
        if live.is_empty() {
            return;
        }

        let k = partition_count.clamp(1, live.len());
        for i in 0..k {
            let pick = live[i * live.len() / k];
            if let Some(s) = &slots[pick] {
                centroids.push(s.vector.clone());
            }
        }

        let dims = centroids.first().map(Vec::len).unwrap_or(0);
        for _ in 0..LLOYD_ROUNDS {
            let mut sums = vec![vec![0.0f32; dims]; centroids.len()];
            let mut counts = vec![0usize; centroids.len()];
            for &i in &live {
                let Some(s) = &slots[i] else { continue };
                let b = Self::nearest_centroid(metric, centroids, &s.vector);
                for (acc, x) in sums[b].iter_mut().zip(s.vector.iter()) {
                    *acc += x;
                }
                counts[b] += 1;
            }
            for (b, count) in counts.iter().enumerate() {
                if *count > 0 {
                    for acc in sums[b].iter_mut() {
                        *acc /= *count as f32;
                    }
                    centroids[b] = std::mem::take(&mut sums[b]);
                }
                // An empty partition keeps its previous centroid.
            }
        }

        buckets.resize(centroids.len(), Vec::new());
        for &i in &live {
            let Some(s) = &slots[i] else { continue };
            let b = Self::nearest_centroid(metric, centroids, &s.vector);
            buckets[b].push(i);
            bucket_of.insert(i, b);
        }
    }
}

#[derive(Clone, Copy)]
struct HeapEntry {
    dist: f32,
    slot: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.slot.cmp(&other.slot))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
