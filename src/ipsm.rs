//! The implemented protocol state machine: a directed graph of server
//! response states inferred from response codes, plus the per-state
//! bookkeeping that drives target-state and seed selection.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;

use libafl_bolts::rands::{Rand, StdRand};

use crate::{
    bolts::hash64_u32s,
    config::SelectionMode,
    queue::{Queue, QueueId},
};

/// Rounds of plain cycling before the favored scoring kicks in.
const WARMUP_ROUNDS: u32 = 5;

/// Probability (%) of skipping an already-fuzzed or unfavored seed while
/// favored entries are still pending.
const SKIP_TO_NEW_PROB: u64 = 99;
/// Probability (%) of skipping an unfavored, already-fuzzed seed otherwise.
const SKIP_NFAV_OLD_PROB: u64 = 95;
/// Probability (%) of skipping an unfavored seed not yet fuzzed here.
const SKIP_NFAV_NEW_PROB: u64 = 75;

#[derive(Debug, Clone)]
pub struct StateRecord {
    pub id: u32,
    /// Reached by at least one execution after the dry run.
    pub is_covered: bool,
    /// Queue entries whose traversal includes this state.
    pub paths: u32,
    /// New interesting paths found while this state was the target.
    pub paths_discovered: u32,
    pub selected_times: u32,
    /// Executions performed while this state was the target.
    pub fuzzs: u32,
    pub score: u32,
    pub seeds: Vec<QueueId>,
    pub selected_seed_index: usize,
    /// Whether the state was first observed during the dry run; drives the
    /// node colour in the DOT dump.
    pub first_seen_in_dry_run: bool,
}

impl StateRecord {
    fn new(id: u32, during_dry_run: bool) -> Self {
        Self {
            id,
            is_covered: false,
            paths: 0,
            paths_discovered: 0,
            selected_times: 0,
            fuzzs: 0,
            score: 1,
            seeds: Vec::new(),
            selected_seed_index: 0,
            first_seen_in_dry_run: during_dry_run,
        }
    }
}

pub struct Ipsm {
    nodes: Vec<StateRecord>,
    index: HashMap<u32, usize>,
    /// Adjacency lists: from-state -> (to-state -> observation count).
    edges: BTreeMap<u32, BTreeMap<u32, u32>>,
    /// Hashes of collapsed state sequences seen so far.
    seen_sequences: HashSet<u64>,
    cursor: usize,
    rounds_completed: u32,
}

/// Collapse consecutive duplicates: `[0, 220, 220, 331]` and
/// `[0, 220, 331, 331]` describe the same path.
pub fn collapse_sequence(seq: &[u32]) -> Vec<u32> {
    let mut out: Vec<u32> = Vec::with_capacity(seq.len());
    for &s in seq {
        if out.last() != Some(&s) {
            out.push(s);
        }
    }
    out
}

impl Ipsm {
    /// A fresh machine containing only the implicit initial state 0.
    pub fn new() -> Self {
        let mut ipsm = Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            edges: BTreeMap::new(),
            seen_sequences: HashSet::new(),
            cursor: 0,
            rounds_completed: 0,
        };
        ipsm.ensure_state(0, true);
        ipsm
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_edges(&self) -> usize {
        self.edges.values().map(BTreeMap::len).sum()
    }

    pub fn state_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.nodes.iter().map(|n| n.id)
    }

    pub fn get(&self, id: u32) -> Option<&StateRecord> {
        self.index.get(&id).map(|&i| &self.nodes[i])
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut StateRecord> {
        self.index.get(&id).copied().map(move |i| &mut self.nodes[i])
    }

    pub fn ensure_state(&mut self, id: u32, during_dry_run: bool) -> &mut StateRecord {
        if let Some(&i) = self.index.get(&id) {
            return &mut self.nodes[i];
        }
        let i = self.nodes.len();
        self.nodes.push(StateRecord::new(id, during_dry_run));
        self.index.insert(id, i);
        &mut self.nodes[i]
    }

    /// Whether this collapsed sequence describes a path we have not seen.
    /// The sequence is recorded either way.
    pub fn is_interesting_sequence(&mut self, collapsed: &[u32]) -> bool {
        self.seen_sequences.insert(hash64_u32s(collapsed))
    }

    /// Extend the machine with the nodes and edges of a collapsed sequence.
    pub fn learn_sequence(&mut self, collapsed: &[u32], during_dry_run: bool) {
        for &s in collapsed {
            self.ensure_state(s, during_dry_run);
        }
        for pair in collapsed.windows(2) {
            *self
                .edges
                .entry(pair[0])
                .or_default()
                .entry(pair[1])
                .or_insert(0) += 1;
        }
    }

    /// Attach a queue entry to every state it traverses. Re-registration
    /// (after recalibration) is a no-op.
    pub fn register_seed(&mut self, id: QueueId, states: &BTreeSet<u32>, during_dry_run: bool) {
        for &s in states {
            let rec = self.ensure_state(s, during_dry_run);
            if !rec.seeds.contains(&id) {
                rec.seeds.push(id);
                rec.paths += 1;
            }
        }
    }

    /// Pick the next target state.
    pub fn choose_target_state(&mut self, mode: SelectionMode, rand: &mut StdRand) -> u32 {
        let chosen = match mode {
            SelectionMode::Random => {
                let i = rand.below(self.nodes.len() as u64) as usize;
                self.nodes[i].id
            }
            SelectionMode::RoundRobin => self.next_round_robin(),
            SelectionMode::Favored => {
                if self.rounds_completed < WARMUP_ROUNDS {
                    self.next_round_robin()
                } else {
                    self.weighted_choice(rand)
                }
            }
        };
        if let Some(rec) = self.get_mut(chosen) {
            rec.selected_times += 1;
        }
        chosen
    }

    fn next_round_robin(&mut self) -> u32 {
        let id = self.nodes[self.cursor % self.nodes.len()].id;
        self.cursor += 1;
        if self.cursor % self.nodes.len() == 0 {
            self.rounds_completed += 1;
        }
        id
    }

    /// Favored-mode score: states that keep yielding new paths while having
    /// consumed little fuzzing effort come out on top.
    fn state_score(rec: &StateRecord) -> u32 {
        let effort = (f64::from(rec.fuzzs) + 1.0).log10() * f64::from(rec.selected_times) + 1.0;
        let yield_bonus = 2f64.powf((f64::from(rec.paths_discovered) + 1.0).ln());
        let score = 1000.0 * 2f64.powf(-effort.log10()) * yield_bonus;
        (score.ceil() as u32).max(1)
    }

    pub fn recompute_scores(&mut self) {
        for rec in &mut self.nodes {
            rec.score = Self::state_score(rec);
        }
    }

    fn weighted_choice(&mut self, rand: &mut StdRand) -> u32 {
        self.recompute_scores();
        let total: u64 = self.nodes.iter().map(|n| u64::from(n.score)).sum();
        let mut x = rand.below(total.max(1));
        for rec in &self.nodes {
            let w = u64::from(rec.score);
            if x < w {
                return rec.id;
            }
            x -= w;
        }
        self.nodes[self.nodes.len() - 1].id
    }

    /// Pick a seed for fuzzing the given target state. Favored mode walks
    /// the state's seed list with skip probabilities biased toward favored
    /// entries that have not been tried against this state yet.
    pub fn choose_seed(
        &mut self,
        state_id: u32,
        queue: &Queue,
        rand: &mut StdRand,
        mode: SelectionMode,
    ) -> Option<QueueId> {
        let pending_favored = queue.pending_favored;
        let queue_len = queue.len();
        let rec = self.get_mut(state_id)?;
        rec.seeds.retain(|&id| id < queue_len);
        if rec.seeds.is_empty() {
            return None;
        }
        match mode {
            SelectionMode::Random => {
                let i = rand.below(rec.seeds.len() as u64) as usize;
                Some(rec.seeds[i])
            }
            SelectionMode::RoundRobin => {
                let i = rec.selected_seed_index % rec.seeds.len();
                rec.selected_seed_index = (i + 1) % rec.seeds.len();
                Some(rec.seeds[i])
            }
            SelectionMode::Favored => {
                let len = rec.seeds.len();
                let start = rec.selected_seed_index % len;
                for step in 0..len {
                    let i = (start + step) % len;
                    let id = rec.seeds[i];
                    let entry = queue.get(id);
                    let fuzzed_here = entry.was_fuzzed.contains(&state_id);
                    let skip_prob = if pending_favored > 0 {
                        if fuzzed_here || !entry.favored {
                            Some(SKIP_TO_NEW_PROB)
                        } else {
                            None
                        }
                    } else if !entry.favored && queue_len > 10 {
                        if fuzzed_here {
                            Some(SKIP_NFAV_OLD_PROB)
                        } else {
                            Some(SKIP_NFAV_NEW_PROB)
                        }
                    } else {
                        None
                    };
                    if let Some(p) = skip_prob {
                        if rand.below(100) < p {
                            continue;
                        }
                    }
                    rec.selected_seed_index = (i + 1) % len;
                    return Some(id);
                }
                // Everything was skipped; fall back to plain cycling.
                let i = rec.selected_seed_index % len;
                rec.selected_seed_index = (i + 1) % len;
                Some(rec.seeds[i])
            }
        }
    }

    /// Serialize as Graphviz: states first seen during the dry run are
    /// blue, later discoveries red.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph ipsm {\n");
        for rec in &self.nodes {
            let colour = if rec.first_seen_in_dry_run {
                "blue"
            } else {
                "red"
            };
            let _ = writeln!(out, "    \"{}\" [color={colour}];", rec.id);
        }
        for (from, tos) in &self.edges {
            for (to, count) in tos {
                let _ = writeln!(out, "    \"{from}\" -> \"{to}\" [label={count}];");
            }
        }
        out.push_str("}\n");
        out
    }

    #[cfg(test)]
    fn force_warmed_up(&mut self) {
        self.rounds_completed = WARMUP_ROUNDS;
    }
}

impl Default for Ipsm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapse_removes_consecutive_duplicates() {
        assert_eq!(collapse_sequence(&[0, 220, 220, 331]), vec![0, 220, 331]);
        assert_eq!(collapse_sequence(&[0, 220, 331, 331]), vec![0, 220, 331]);
        assert_eq!(collapse_sequence(&[]), Vec::<u32>::new());
    }

    #[test]
    fn collapsed_equal_sequences_are_one_path() {
        let mut ipsm = Ipsm::new();
        let a = collapse_sequence(&[0, 220, 220, 331]);
        let b = collapse_sequence(&[0, 220, 331, 331]);
        assert!(ipsm.is_interesting_sequence(&a));
        assert!(!ipsm.is_interesting_sequence(&b));
    }

    #[test]
    fn learning_builds_nodes_and_edges() {
        let mut ipsm = Ipsm::new();
        ipsm.learn_sequence(&[0, 220, 331], true);
        ipsm.learn_sequence(&[0, 220, 530], false);
        assert_eq!(ipsm.n_nodes(), 4);
        assert_eq!(ipsm.n_edges(), 3);
        assert!(ipsm.get(530).is_some());
        assert!(!ipsm.get(530).unwrap().first_seen_in_dry_run);

        let dot = ipsm.to_dot();
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("\"220\" [color=blue]"));
        assert!(dot.contains("\"530\" [color=red]"));
        assert!(dot.contains("\"220\" -> \"331\""));
    }

    #[test]
    fn favored_mode_prefers_the_productive_untouched_state() {
        // States {0, 1, 2} with selected_times [10, 0, 10], fuzzs
        // [100, 0, 100], paths_discovered [1, 5, 1]: state 1 must dominate.
        let mut ipsm = Ipsm::new();
        ipsm.learn_sequence(&[0, 1, 2], true);
        for (id, sel, fuzzs, disc) in [(0, 10, 100, 1), (1, 0, 0, 5), (2, 10, 100, 1)] {
            let rec = ipsm.get_mut(id).unwrap();
            rec.selected_times = sel;
            rec.fuzzs = fuzzs;
            rec.paths_discovered = disc;
        }
        ipsm.force_warmed_up();

        let mut rand = StdRand::with_seed(0xdecafbad);
        let mut hits = 0usize;
        let rounds = 1000;
        for _ in 0..rounds {
            if ipsm.choose_target_state(SelectionMode::Favored, &mut rand) == 1 {
                hits += 1;
            }
            // Selection bumps selected_times; reset to keep the fixture.
            for (id, sel) in [(0, 10), (1, 0), (2, 10)] {
                ipsm.get_mut(id).unwrap().selected_times = sel;
            }
        }
        assert!(
            hits >= 600,
            "state 1 chosen only {hits}/{rounds} times under favored scoring"
        );
    }

    #[test]
    fn round_robin_cycles_all_states() {
        let mut ipsm = Ipsm::new();
        ipsm.learn_sequence(&[0, 7, 9], true);
        let mut rand = StdRand::with_seed(3);
        let picks: Vec<u32> = (0..6)
            .map(|_| ipsm.choose_target_state(SelectionMode::RoundRobin, &mut rand))
            .collect();
        assert_eq!(picks, vec![0, 7, 9, 0, 7, 9]);
    }

    #[test]
    fn seed_choice_prefers_unseen_favored_entries() {
        use crate::queue::{Queue, QueueEntry};
        use std::path::PathBuf;

        let mut queue = Queue::new();
        let mut mk = |name: &str, favored: bool, fuzzed: bool| {
            let mut e = QueueEntry::new(PathBuf::from(name), 1, Vec::new());
            e.favored = favored;
            if fuzzed {
                e.was_fuzzed.insert(5);
            }
            e.state_set = [5u32].into_iter().collect();
            queue.add(e)
        };
        let stale = mk("stale", false, true);
        let fresh = mk("fresh", true, false);
        queue.pending_favored = 1;

        let mut ipsm = Ipsm::new();
        ipsm.ensure_state(5, true);
        ipsm.register_seed(stale, &queue.get(stale).state_set.clone(), true);
        ipsm.register_seed(fresh, &queue.get(fresh).state_set.clone(), true);

        let mut rand = StdRand::with_seed(11);
        let mut fresh_hits = 0;
        for _ in 0..100 {
            ipsm.get_mut(5).unwrap().selected_seed_index = 0;
            if ipsm.choose_seed(5, &queue, &mut rand, SelectionMode::Favored) == Some(fresh) {
                fresh_hits += 1;
            }
        }
        assert!(fresh_hits > 90, "only {fresh_hits}/100 picks of the fresh favored seed");
    }
}
