//! The seed queue: one entry per message sequence on disk, with region
//! annotations, calibration results, and the favorites table that culling
//! maintains over the coverage map.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use libafl_bolts::Error;
use serde::{Deserialize, Serialize};

use crate::coverage::{minimize_bits, MAP_SIZE};

/// Energy cap multiplier; scores are clamped to `HAVOC_MAX_MULT * 100`.
pub const HAVOC_MAX_MULT: u32 = 16;

/// One protocol message inside a seed file: the byte span `[start, end)`
/// plus the server state ids observed after this message was sent (the last
/// element is the state the server ended up in).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub start: usize,
    pub end: usize,
    pub state_seq: Vec<u32>,
}

impl Region {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// State the server reached after this message, if it answered at all.
    pub fn final_state(&self) -> Option<u32> {
        self.state_seq.last().copied()
    }
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub fname: PathBuf,
    pub len: usize,
    pub depth: u32,
    /// Unix time of discovery, seconds.
    pub found_at: u64,
    pub regions: Vec<Region>,

    // Calibration results.
    pub exec_us: u64,
    pub bitmap_size: u32,
    pub exec_cksum: u64,
    pub handicap: u32,
    pub cal_failed: u8,

    pub favored: bool,
    /// Target states this entry has already been fuzzed against.
    pub was_fuzzed: BTreeSet<u32>,
    pub passed_det: bool,
    pub var_behavior: bool,
    pub has_new_cov: bool,
    pub is_initial_seed: bool,

    /// Target state that was active when this entry was discovered.
    pub generating_state_id: u32,
    /// Distinct states in the entry's traversal.
    pub state_set: BTreeSet<u32>,

    /// 1-bit-per-edge fingerprint, kept while the entry wins any map byte.
    pub trace_mini: Option<Vec<u8>>,
    pub tc_ref: u32,
}

impl QueueEntry {
    pub fn new(fname: PathBuf, len: usize, regions: Vec<Region>) -> Self {
        // Every traversal passes through the implicit initial state.
        let mut state_set = BTreeSet::from([0]);
        for r in &regions {
            state_set.extend(r.state_seq.iter().copied());
        }
        Self {
            fname,
            len,
            depth: 0,
            found_at: 0,
            regions,
            exec_us: 0,
            bitmap_size: 0,
            exec_cksum: 0,
            handicap: 0,
            cal_failed: 0,
            favored: false,
            was_fuzzed: BTreeSet::new(),
            passed_det: false,
            var_behavior: false,
            has_new_cov: false,
            is_initial_seed: false,
            generating_state_id: 0,
            state_set,
            trace_mini: None,
            tc_ref: 0,
        }
    }

    pub fn unique_state_count(&self) -> usize {
        self.state_set.len()
    }

    pub fn load_input(&self) -> Result<Vec<u8>, Error> {
        Ok(fs::read(&self.fname)?)
    }

    /// Region invariant: intervals are disjoint, contiguous, and exactly
    /// cover `[0, len)`.
    pub fn validate_regions(&self) -> Result<(), Error> {
        let mut cursor = 0usize;
        for r in &self.regions {
            if r.start != cursor || r.end < r.start {
                return Err(Error::illegal_state(format!(
                    "Region [{}, {}) breaks the partition of {:?} at offset {cursor}",
                    r.start, r.end, self.fname
                )));
            }
            cursor = r.end;
        }
        if cursor != self.len {
            return Err(Error::illegal_state(format!(
                "Regions of {:?} cover {cursor} bytes of {}",
                self.fname, self.len
            )));
        }
        Ok(())
    }

    fn fav_factor(&self) -> u128 {
        u128::from(self.exec_us) * self.len as u128
    }

    /// Winner ordering for the favorites table: more distinct states first,
    /// then cheaper executions.
    fn beats(&self, incumbent: &QueueEntry) -> bool {
        match self
            .unique_state_count()
            .cmp(&incumbent.unique_state_count())
        {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.fav_factor() < incumbent.fav_factor(),
        }
    }

    /// Recompute the distinct-state set after region annotations changed.
    pub fn refresh_state_set(&mut self) {
        self.state_set.clear();
        self.state_set.insert(0);
        for r in &self.regions {
            self.state_set.extend(r.state_seq.iter().copied());
        }
    }
}

pub type QueueId = usize;

pub struct Queue {
    pub entries: Vec<QueueEntry>,
    /// For each map byte, the entry currently winning that byte.
    top_rated: Vec<Option<QueueId>>,
    score_changed: bool,
    pub pending_not_fuzzed: usize,
    pub pending_favored: usize,
    pub max_depth: u32,
}

impl Queue {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            top_rated: vec![None; MAP_SIZE],
            score_changed: false,
            pending_not_fuzzed: 0,
            pending_favored: 0,
            max_depth: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: QueueId) -> &QueueEntry {
        &self.entries[id]
    }

    pub fn get_mut(&mut self, id: QueueId) -> &mut QueueEntry {
        &mut self.entries[id]
    }

    pub fn add(&mut self, entry: QueueEntry) -> QueueId {
        let id = self.entries.len();
        self.max_depth = self.max_depth.max(entry.depth);
        self.pending_not_fuzzed += 1;
        self.entries.push(entry);
        id
    }

    /// Register a classified trace for an entry, possibly dethroning other
    /// winners byte by byte.
    pub fn update_bitmap_score(&mut self, id: QueueId, trace: &[u8]) {
        debug_assert_eq!(trace.len(), MAP_SIZE);
        let mut fresh_winner = false;
        for (i, &t) in trace.iter().enumerate() {
            if t == 0 {
                continue;
            }
            if let Some(incumbent) = self.top_rated[i] {
                if incumbent == id || !self.entries[id].beats(&self.entries[incumbent]) {
                    continue;
                }
                let old = &mut self.entries[incumbent];
                old.tc_ref -= 1;
                if old.tc_ref == 0 {
                    old.trace_mini = None;
                }
            }
            self.top_rated[i] = Some(id);
            self.entries[id].tc_ref += 1;
            fresh_winner = true;
        }
        if fresh_winner {
            let entry = &mut self.entries[id];
            if entry.trace_mini.is_none() {
                let mut mini = vec![0u8; MAP_SIZE >> 3];
                minimize_bits(&mut mini, trace);
                entry.trace_mini = Some(mini);
            }
            self.score_changed = true;
        }
    }

    /// Re-derive the favored set from the winners table. Runs only when
    /// scoring changed since the last cull. `redundant_dir`, when given,
    /// receives marker files for entries with no winner role.
    pub fn cull(&mut self, current_state: u32, redundant_dir: Option<&Path>) {
        if !self.score_changed {
            return;
        }
        self.score_changed = false;

        let mut temp_v = vec![0xffu8; MAP_SIZE >> 3];
        for entry in self.entries.iter_mut() {
            if !entry.is_initial_seed {
                entry.favored = false;
            }
        }
        self.pending_favored = 0;

        for i in 0..MAP_SIZE {
            if temp_v[i >> 3] & (1 << (i & 7)) == 0 {
                continue;
            }
            let Some(id) = self.top_rated[i] else { continue };
            let entry = &mut self.entries[id];
            if let Some(mini) = &entry.trace_mini {
                for (v, m) in temp_v.iter_mut().zip(mini.iter()) {
                    *v &= !m;
                }
            }
            if !entry.favored {
                entry.favored = true;
                if entry.state_set.contains(&current_state)
                    && !entry.was_fuzzed.contains(&current_state)
                {
                    self.pending_favored += 1;
                }
            }
        }

        if let Some(dir) = redundant_dir {
            for entry in &self.entries {
                let Some(name) = entry.fname.file_name() else {
                    continue;
                };
                let marker = dir.join(name);
                let res = if entry.favored {
                    match fs::remove_file(&marker) {
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                        other => other,
                    }
                } else {
                    fs::write(&marker, []).map(|_| ())
                };
                if let Err(e) = res {
                    log::warn!("Cannot update redundancy marker {marker:?}: {e}");
                }
            }
        }
    }

    /// Per-entry havoc energy, combining execution speed, coverage mass,
    /// late-arrival handicap and depth, clamped to `[1, HAVOC_MAX_MULT *
    /// 100]`. Consumes handicap credit as it is spent.
    pub fn calculate_score(
        &mut self,
        id: QueueId,
        avg_exec_us: f64,
        avg_bitmap_size: f64,
    ) -> u32 {
        let entry = &mut self.entries[id];
        let mut perf: f64 = 100.0;

        let exec_us = entry.exec_us as f64;
        if avg_exec_us > 0.0 {
            perf = if exec_us * 0.1 > avg_exec_us {
                10.0
            } else if exec_us * 0.25 > avg_exec_us {
                25.0
            } else if exec_us * 0.5 > avg_exec_us {
                50.0
            } else if exec_us * 0.75 > avg_exec_us {
                75.0
            } else if exec_us * 4.0 < avg_exec_us {
                300.0
            } else if exec_us * 3.0 < avg_exec_us {
                200.0
            } else if exec_us * 2.0 < avg_exec_us {
                150.0
            } else {
                100.0
            };
        }

        let bitmap = f64::from(entry.bitmap_size);
        if avg_bitmap_size > 0.0 {
            if bitmap * 0.3 > avg_bitmap_size {
                perf *= 3.0;
            } else if bitmap * 0.5 > avg_bitmap_size {
                perf *= 2.0;
            } else if bitmap * 0.75 > avg_bitmap_size {
                perf *= 1.5;
            } else if bitmap * 3.0 < avg_bitmap_size {
                perf *= 0.25;
            } else if bitmap * 2.0 < avg_bitmap_size {
                perf *= 0.5;
            } else if bitmap * 1.5 < avg_bitmap_size {
                perf *= 0.75;
            }
        }

        if entry.handicap >= 4 {
            perf *= 4.0;
            entry.handicap -= 4;
        } else if entry.handicap > 0 {
            perf *= 2.0;
            entry.handicap -= 1;
        }

        perf *= match entry.depth {
            0..=3 => 1.0,
            4..=7 => 2.0,
            8..=13 => 3.0,
            14..=25 => 4.0,
            _ => 5.0,
        };

        let cap = f64::from(HAVOC_MAX_MULT * 100);
        (perf.min(cap) as u32).max(1)
    }

    /// Favorites-cover check used by tests and debug assertions: every map
    /// byte present in any entry's trace has a favored winner.
    pub fn favored_entries(&self) -> impl Iterator<Item = QueueId> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.favored)
            .map(|(id, _)| id)
    }

    pub fn winner_of(&self, edge: usize) -> Option<QueueId> {
        self.top_rated[edge]
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with_trace(name: &str, exec_us: u64, len: usize, states: &[u32]) -> QueueEntry {
        let mut e = QueueEntry::new(PathBuf::from(name), len, Vec::new());
        e.exec_us = exec_us;
        e.state_set = states.iter().copied().collect();
        e
    }

    fn trace_with(edges: &[usize]) -> Vec<u8> {
        let mut t = vec![0u8; MAP_SIZE];
        for &e in edges {
            t[e] = 1;
        }
        t
    }

    #[test]
    fn region_partition_invariant() {
        let regions = vec![
            Region {
                start: 0,
                end: 4,
                state_seq: vec![220],
            },
            Region {
                start: 4,
                end: 10,
                state_seq: vec![220, 331],
            },
        ];
        let entry = QueueEntry::new(PathBuf::from("seed"), 10, regions);
        entry.validate_regions().unwrap();
        // 220, 331 and the implicit initial state.
        assert_eq!(entry.unique_state_count(), 3);

        let bad = QueueEntry::new(
            PathBuf::from("seed"),
            10,
            vec![Region {
                start: 0,
                end: 9,
                state_seq: vec![],
            }],
        );
        assert!(bad.validate_regions().is_err());
    }

    #[test]
    fn winner_prefers_more_states_then_cheaper() {
        let mut q = Queue::new();
        let deep = q.add(entry_with_trace("deep", 900, 10, &[0, 1, 2]));
        let fast = q.add(entry_with_trace("fast", 10, 10, &[0]));
        q.update_bitmap_score(deep, &trace_with(&[5]));
        q.update_bitmap_score(fast, &trace_with(&[5]));
        // More unique states wins even though it is slower.
        assert_eq!(q.winner_of(5), Some(deep));

        let cheap = q.add(entry_with_trace("cheap", 5, 10, &[0, 1, 2]));
        q.update_bitmap_score(cheap, &trace_with(&[5]));
        assert_eq!(q.winner_of(5), Some(cheap));
    }

    #[test]
    fn cull_covers_every_touched_edge() {
        let mut q = Queue::new();
        let a = q.add(entry_with_trace("a", 100, 10, &[0, 1]));
        let b = q.add(entry_with_trace("b", 100, 10, &[0]));
        let c = q.add(entry_with_trace("c", 50, 10, &[0]));
        let traces = [
            (a, trace_with(&[1, 2, 3])),
            (b, trace_with(&[3, 4])),
            (c, trace_with(&[4])),
        ];
        for (id, trace) in &traces {
            q.update_bitmap_score(*id, trace);
        }
        q.cull(0, None);

        // Property: every edge byte in any entry's trace is covered by some
        // favored entry.
        let favored: Vec<_> = q.favored_entries().collect();
        for (_, trace) in &traces {
            for (edge, &t) in trace.iter().enumerate() {
                if t == 0 {
                    continue;
                }
                assert!(
                    favored.iter().any(|&f| {
                        q.get(f)
                            .trace_mini
                            .as_ref()
                            .map(|m| m[edge >> 3] & (1 << (edge & 7)) != 0)
                            .unwrap_or(false)
                    }),
                    "edge {edge} has no favored cover"
                );
            }
        }
        // Entry `a` dominates edges 1-3 and `c` is the cheaper winner of 4;
        // `b` should be redundant.
        assert!(q.get(a).favored);
        assert!(!q.get(b).favored);
        assert!(q.get(c).favored);
    }

    #[test]
    fn score_stays_clamped() {
        let mut q = Queue::new();
        let id = q.add(entry_with_trace("hot", 1, 1, &[0]));
        q.get_mut(id).bitmap_size = 10_000;
        q.get_mut(id).handicap = 8;
        q.get_mut(id).depth = 40;
        let score = q.calculate_score(id, 10_000.0, 1.0);
        assert!(score <= HAVOC_MAX_MULT * 100);
        assert!(score >= 1);

        let slow = q.add(entry_with_trace("cold", 1_000_000, 1, &[0]));
        q.get_mut(slow).bitmap_size = 1;
        let score = q.calculate_score(slow, 10.0, 10_000.0);
        assert!((1..=HAVOC_MAX_MULT * 100).contains(&score));
    }
}
