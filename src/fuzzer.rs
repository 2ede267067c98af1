//! The fuzzer context and the core loop: pick a target state, cull the
//! queue, pick a seed, fuzz it, bookkeep. All process-wide state lives in
//! one owned [`Fuzzer`] value; signal handlers only flip atomic flags on
//! it.

use std::{
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use libafl_bolts::{
    current_nanos,
    rands::{Rand, StdRand},
    Error,
};
use nix::sys::signal::Signal;
use signal_hook::consts::{SIGUSR1, SIGWINCH, TERM_SIGNALS};

use crate::{
    calibration,
    config::Config,
    coverage::{
        classify_counts, count_non_255_bytes, has_new_bits, hash_trace, simplify_trace,
        CoverageState, TraceMap, EXEC_FAIL_SIG, MAP_SIZE,
    },
    dictionary::Dictionary,
    forkserver::{ExecDriver, Fault},
    grammar::GrammarStore,
    ipsm::{collapse_sequence, Ipsm},
    mutation::{
        self, deterministic_stages, havoc_stage, splice_m2, StageCtx, StageTag, TrialFeedback,
        TrialRunner, SPLICE_CYCLES,
    },
    net::{NetDriver, ResponseBuffer, SequenceOutcome},
    oracle::ChatClient,
    output::{OutputDirs, PlotRow},
    protocol::{handler_for, regions_from_requests, ProtocolHandler},
    queue::{Queue, QueueEntry, QueueId, Region},
};

/// Consecutive uninteresting iterations before the oracle is consulted.
pub const STALL_THRESHOLD: u64 = 512;
/// How often the stats file, plot and bitmap snapshot are refreshed.
const OUTPUT_INTERVAL: Duration = Duration::from_secs(5);
/// Reseed the PRNG from the OS after this many executions.
const RESEED_EVERY: u64 = 100_000;
/// At most this many oracle-enriched variants are added to the corpus.
const MAX_ENRICHED_SEEDS: usize = 16;

/// Flags flipped from signal context.
pub struct StopFlags {
    pub stop_soon: Arc<AtomicBool>,
    pub skip_requested: Arc<AtomicBool>,
    pub redraw: Arc<AtomicBool>,
}

impl StopFlags {
    fn register() -> Result<Self, Error> {
        let stop_soon = Arc::new(AtomicBool::new(false));
        let skip_requested = Arc::new(AtomicBool::new(false));
        let redraw = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            signal_hook::flag::register(*sig, Arc::clone(&stop_soon))?;
        }
        signal_hook::flag::register(SIGUSR1, Arc::clone(&skip_requested))?;
        signal_hook::flag::register(SIGWINCH, Arc::clone(&redraw))?;
        Ok(Self {
            stop_soon,
            skip_requested,
            redraw,
        })
    }
}

#[derive(Default)]
pub struct Stats {
    pub total_execs: u64,
    pub queue_cycle: u64,
    pub cycles_done: u64,
    pub cur_entry: usize,
    pub unique_crashes: u64,
    pub total_crashes: u64,
    pub unique_hangs: u64,
    pub total_tmouts: u64,
    pub total_cal_us: u64,
    pub total_cal_cycles: u64,
    pub total_bitmap_size: u64,
    pub total_bitmap_entries: u64,
    pub uninteresting_iters: u64,
    pub stall_probes: u32,
    pub last_path_at: Option<Instant>,
}

impl Stats {
    pub fn avg_exec_us(&self) -> f64 {
        if self.total_cal_cycles == 0 {
            0.0
        } else {
            self.total_cal_us as f64 / self.total_cal_cycles as f64
        }
    }

    pub fn avg_bitmap_size(&self) -> f64 {
        if self.total_bitmap_entries == 0 {
            0.0
        } else {
            self.total_bitmap_size as f64 / self.total_bitmap_entries as f64
        }
    }
}

pub struct Fuzzer {
    pub cfg: Config,
    pub rand: StdRand,
    pub trace: TraceMap,
    pub cov: CoverageState,
    pub exec: ExecDriver,
    pub net: NetDriver,
    pub protocol: Box<dyn ProtocolHandler>,
    pub grammar: GrammarStore,
    pub dict: Dictionary,
    pub oracle: ChatClient,
    pub queue: Queue,
    pub ipsm: Ipsm,
    pub out: OutputDirs,
    pub stats: Stats,
    pub flags: StopFlags,
    /// Map bytes that varied across calibration runs.
    pub var_bytes: Vec<u8>,
    /// Target state of the current iteration.
    pub current_state: u32,
    pub exec_timeout: Duration,
    pub dry_run_active: bool,
    start_time: Instant,
    last_output_at: Instant,
    // Identity of the mutation behind the trial in flight, for artifact
    // file names.
    stage_name: &'static str,
    stage_cur_byte: i64,
    stage_cur_val: i64,
}

impl Fuzzer {
    pub fn new(mut cfg: Config) -> Result<Self, Error> {
        cfg.apply_env()?;
        let out = OutputDirs::create(&cfg.out_dir, cfg.resume)?;
        let trace = TraceMap::new()?;
        let mut cov = CoverageState::new();

        let mut exec_timeout = cfg.exec_timeout();
        let mut resume_entry = 0usize;
        if cfg.resume {
            if let Ok(stats) = out.read_stats() {
                if let Some(ms) = stats.get("exec_timeout").and_then(|s| s.parse::<u64>().ok()) {
                    exec_timeout = Duration::from_millis(ms);
                }
                if let Some(cur) = stats.get("cur_path").and_then(|s| s.parse::<usize>().ok()) {
                    resume_entry = cur;
                }
            }
            match out.read_bitmap() {
                Ok(snapshot) => cov.restore_virgin_bits(&snapshot)?,
                Err(e) => log::warn!("No bitmap snapshot to resume from: {e}"),
            }
        }

        let mut oracle = ChatClient::from_env();
        let grammar_path = out
            .grammars_dir()
            .join(format!("{}.json", cfg.protocol.to_lowercase()));
        let grammar = if grammar_path.exists() {
            match GrammarStore::load(&grammar_path) {
                Ok(g) => g,
                Err(e) => {
                    log::warn!("Could not load saved grammar: {e}");
                    GrammarStore::empty()
                }
            }
        } else {
            let templates = oracle.induce_grammar(&cfg.protocol);
            if templates.is_empty() {
                GrammarStore::empty()
            } else {
                let g = GrammarStore::from_templates(templates)?;
                if let Err(e) = g.save(&grammar_path) {
                    log::warn!("Could not persist grammar: {e}");
                }
                g
            }
        };

        let mut dict = Dictionary::new();
        if let Some(dir) = &cfg.dict_dir {
            dict.load_extras(dir)?;
        }
        if cfg.resume {
            if let Err(e) = dict.load_auto(&out.auto_extras_dir()) {
                log::warn!("Could not reload auto extras: {e}");
            }
        }

        let flags = StopFlags::register()?;
        let protocol = handler_for(&cfg.protocol);
        let net = NetDriver::new(&cfg);
        let exec = ExecDriver::start(&cfg)?;

        let now = Instant::now();
        let mut fz = Self {
            rand: StdRand::with_seed(current_nanos()),
            trace,
            cov,
            exec,
            net,
            protocol,
            grammar,
            dict,
            oracle,
            queue: Queue::new(),
            ipsm: Ipsm::new(),
            out,
            stats: Stats::default(),
            flags,
            var_bytes: vec![0u8; MAP_SIZE],
            current_state: 0,
            exec_timeout,
            dry_run_active: false,
            start_time: now,
            last_output_at: now,
            stage_name: "init",
            stage_cur_byte: -1,
            stage_cur_val: -1,
            cfg,
        };
        fz.stats.cur_entry = resume_entry;
        fz.setup_seeds()?;
        calibration::perform_dry_run(&mut fz)?;
        Ok(fz)
    }

    /* ---------------- corpus setup ---------------- */

    fn setup_seeds(&mut self) -> Result<(), Error> {
        let mut files: Vec<PathBuf> = self
            .cfg
            .in_dir
            .read_dir()?
            .filter_map(Result::ok)
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(Error::illegal_argument(format!(
                "No seed files in {}",
                self.cfg.in_dir.display()
            )));
        }

        let mut seeds: Vec<(String, Vec<u8>)> = Vec::new();
        for path in &files {
            let data = fs::read(path)?;
            if data.is_empty() {
                log::warn!("Skipping empty seed {path:?}");
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().replace(['/', ','], "_"))
                .unwrap_or_else(|| "seed".to_string());
            seeds.push((name, data));
        }

        // Ask the oracle to fill in message types the corpus never uses.
        if self.oracle.is_enabled() && !self.grammar.is_empty() {
            let mut enriched = Vec::new();
            for (name, data) in &seeds {
                if enriched.len() >= MAX_ENRICHED_SEEDS {
                    break;
                }
                let missing: Vec<String> = self
                    .grammar
                    .headers()
                    .filter(|h| !contains_subslice(data, h.as_bytes()))
                    .map(str::to_string)
                    .collect();
                if let Some(header) = missing.first() {
                    if let Some(variant) = self.oracle.enrich_seed(data, header) {
                        log::info!("Oracle enriched {name} with {header:?}");
                        enriched.push((format!("enriched_{name}"), variant));
                    }
                }
            }
            seeds.extend(enriched);
        }

        let now_unix = unix_time();
        for (name, data) in seeds {
            let id = self.queue.len();
            let fname = self.out.queue_dir().join(format!("id:{id:06},orig:{name}"));
            fs::write(&fname, &data)?;
            let regions = regions_from_requests(&self.protocol.extract_requests(&data));
            let mut entry = QueueEntry::new(fname, data.len(), regions);
            entry.is_initial_seed = true;
            entry.found_at = now_unix;
            // On resume, seed names are the previous session's entry names
            // and carry over their stage markers.
            if self.cfg.resume {
                if self.out.has_state_mark("deterministic_done", &name) {
                    entry.passed_det = true;
                }
                if self.out.has_state_mark("variable_behavior", &name) {
                    entry.var_behavior = true;
                }
            }
            entry.validate_regions()?;
            self.queue.add(entry);
        }
        log::info!("Loaded {} seeds into the queue", self.queue.len());
        Ok(())
    }

    /* ---------------- execution pipeline ---------------- */

    pub fn stop_requested(&self) -> bool {
        self.flags.stop_soon.load(Ordering::Relaxed)
    }

    /// Deliver one candidate sequence to a fresh child and classify the
    /// coverage it produced.
    pub fn run_target_sequence(
        &mut self,
        buf: &[u8],
        bounds: &[usize],
    ) -> Result<(Fault, SequenceOutcome), Error> {
        let mut messages: Vec<&[u8]> = Vec::with_capacity(bounds.len());
        let mut prev = 0usize;
        for &b in bounds {
            let end = b.min(buf.len());
            messages.push(&buf[prev.min(end)..end]);
            prev = end;
        }
        if messages.is_empty() {
            messages.push(buf);
        }

        self.trace.reset();
        self.cov.reset_session();
        self.exec.begin_run(&self.cfg)?;

        let net = &self.net;
        let trace = &self.trace;
        let session = &mut self.cov.session;
        let outcome = match net.send_sequence(&messages, || {
            let mut copy = trace.as_slice().to_vec();
            classify_counts(&mut copy);
            has_new_bits(session, &copy) != 0
        }) {
            Ok(outcome) => outcome,
            Err(e) => {
                // Transient network failure: the sequence is lost but the
                // iteration goes on.
                log::debug!("Sequence delivery failed: {e}");
                SequenceOutcome {
                    responses: ResponseBuffer::default(),
                    likely_buggy: true,
                }
            }
        };

        if self.cfg.terminate_child {
            self.exec.terminate_child(Signal::SIGTERM);
        }
        let first_word = self.trace.first_word();
        let mut fault = self.exec.await_status(self.exec_timeout)?;
        classify_counts(self.trace.as_mut_slice());
        if first_word == EXEC_FAIL_SIG {
            fault = Fault::Error;
        }
        self.stats.total_execs += 1;
        if self.stats.total_execs % RESEED_EVERY == 0 {
            self.rand = StdRand::with_seed(current_nanos());
        }
        Ok((fault, outcome))
    }

    /// Decode response codes, judge path interestingness, and keep the
    /// per-state counters current. Returns whether the collapsed sequence
    /// was new, plus the decoded codes.
    pub fn update_state_tracking(&mut self, responses: &ResponseBuffer) -> (bool, Vec<u32>) {
        let codes = self.protocol.extract_response_codes(&responses.data);
        let mut full = Vec::with_capacity(codes.len() + 1);
        full.push(0);
        full.extend_from_slice(&codes);
        let collapsed = collapse_sequence(&full);

        let interesting = self.ipsm.is_interesting_sequence(&collapsed);
        if interesting {
            self.ipsm.learn_sequence(&collapsed, self.dry_run_active);
            if let Err(e) = self.out.write_dot(&self.ipsm.to_dot()) {
                log::warn!("Cannot write ipsm.dot: {e}");
            }
            let name = format!("seq_{:06}", self.stats.total_execs);
            if let Err(e) = self.out.save_response(&name, &responses.data) {
                log::warn!("Cannot save response buffer: {e}");
            }
            if !self.dry_run_active {
                if let Some(rec) = self.ipsm.get_mut(self.current_state) {
                    rec.paths_discovered += 1;
                }
            }
        }
        if !self.dry_run_active {
            for &s in &collapsed {
                if let Some(rec) = self.ipsm.get_mut(s) {
                    rec.is_covered = true;
                }
            }
        }
        self.ipsm
            .ensure_state(self.current_state, self.dry_run_active)
            .fuzzs += 1;
        (interesting, codes)
    }

    fn describe_op(&self) -> String {
        let mut op = format!("op:{}", self.stage_name);
        if self.stage_cur_byte >= 0 {
            op.push_str(&format!(",pos:{}", self.stage_cur_byte));
            if matches!(
                self.stage_name,
                "arith8" | "arith16" | "arith32" | "int8" | "int16" | "int32"
            ) {
                op.push_str(&format!(",val:{}", self.stage_cur_val));
            }
        }
        op
    }

    /// Judge an execution and keep what deserves keeping: new queue
    /// entries, unique crashes, unique hangs.
    pub fn save_if_interesting(
        &mut self,
        buf: &[u8],
        bounds: &[usize],
        fault: Fault,
        responses: &ResponseBuffer,
        likely_buggy: bool,
        interesting_seq: bool,
    ) -> Result<bool, Error> {
        match fault {
            Fault::None => self.save_queue_candidate(buf, responses, likely_buggy, interesting_seq),
            Fault::Timeout => {
                self.stats.total_tmouts += 1;
                self.save_hang_candidate(buf, bounds)?;
                Ok(false)
            }
            Fault::Crash => {
                self.stats.total_crashes += 1;
                self.save_crash_candidate(buf)?;
                Ok(false)
            }
            Fault::Error => {
                log::warn!("Target failed to exec");
                Ok(false)
            }
            Fault::NoInstrumentation | Fault::NoBits => Ok(false),
        }
    }

    fn save_queue_candidate(
        &mut self,
        buf: &[u8],
        responses: &ResponseBuffer,
        likely_buggy: bool,
        interesting_seq: bool,
    ) -> Result<bool, Error> {
        let hnb = has_new_bits(&mut self.cov.virgin_bits, self.trace.as_slice());
        if hnb == 0 && !interesting_seq {
            return Ok(false);
        }
        // A server that went silent mid-sequence produces coverage of
        // dubious provenance; with false-negative reduction on, such runs
        // are dropped even when they touched new edges.
        if self.cfg.false_negative_reduction && likely_buggy {
            return Ok(false);
        }

        let id = self.queue.len();
        let op = self.describe_op();
        let fname = self.out.queue_entry_path(id, &op, hnb == 2);
        fs::write(&fname, buf)?;

        let mut regions = regions_from_requests(&self.protocol.extract_requests(buf));
        annotate_regions(&mut regions, responses, self.protocol.as_ref());
        let mut entry = QueueEntry::new(fname.clone(), buf.len(), regions);
        entry.depth = self
            .queue
            .entries
            .get(self.stats.cur_entry)
            .map(|p| p.depth + 1)
            .unwrap_or(1);
        entry.found_at = unix_time();
        entry.generating_state_id = self.current_state;
        entry.handicap = self.stats.queue_cycle.saturating_sub(1) as u32;
        entry.has_new_cov = hnb == 2;
        let id = self.queue.add(entry);

        if let Some(name) = fname.file_name().map(|n| n.to_string_lossy().to_string()) {
            let _ = fs::copy(&fname, self.out.replayable_queue_dir().join(&name));
            if interesting_seq {
                let _ = fs::copy(&fname, self.out.new_ipsm_paths_dir().join(&name));
            }
            let regions = self.queue.get(id).regions.clone();
            if let Err(e) = self.out.save_regions(&name, &regions) {
                log::warn!("Cannot persist regions for {name}: {e}");
            }
        }

        calibration::calibrate_case(self, id, false)?;
        self.stats.last_path_at = Some(Instant::now());
        log::debug!("New queue entry {id} (map {hnb}, new path {interesting_seq})");
        Ok(true)
    }

    fn save_hang_candidate(&mut self, buf: &[u8], bounds: &[usize]) -> Result<(), Error> {
        let mut simplified = self.trace.as_slice().to_vec();
        simplify_trace(&mut simplified);
        if has_new_bits(&mut self.cov.virgin_tmout, &simplified) == 0 {
            return Ok(());
        }
        // Re-check with a generous timeout; slow is not hung.
        let saved_timeout = self.exec_timeout;
        self.exec_timeout = self.cfg.hang_timeout();
        let recheck = self.run_target_sequence(buf, bounds);
        self.exec_timeout = saved_timeout;
        match recheck {
            Ok((Fault::Crash, _)) => {
                self.stats.total_crashes += 1;
                return self.save_crash_candidate(buf);
            }
            Ok((Fault::Timeout, _)) => {}
            Ok(_) => return Ok(()),
            Err(e) => {
                log::debug!("Hang re-check failed: {e}");
                return Ok(());
            }
        }
        let path = self.out.hang_path(
            self.stats.unique_hangs as usize,
            self.stats.cur_entry,
            &self.describe_op(),
        );
        fs::write(path, buf)?;
        self.stats.unique_hangs += 1;
        Ok(())
    }

    fn save_crash_candidate(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut simplified = self.trace.as_slice().to_vec();
        simplify_trace(&mut simplified);
        if has_new_bits(&mut self.cov.virgin_crash, &simplified) == 0 {
            return Ok(());
        }
        let path = self.out.crash_path(
            self.stats.unique_crashes as usize,
            self.exec.last_signal(),
            self.stats.cur_entry,
            &self.describe_op(),
        );
        fs::write(path, buf)?;
        self.stats.unique_crashes += 1;
        log::info!(
            "Unique crash #{} (signal {})",
            self.stats.unique_crashes,
            self.exec.last_signal()
        );
        Ok(())
    }

    /* ---------------- one iteration (C8) ---------------- */

    /// Select M2: the contiguous run of regions answering in the target
    /// state, or a random subrange when no region matches (or state
    /// awareness is off).
    fn select_m2(&mut self, id: QueueId) -> (usize, usize) {
        let entry = self.queue.get(id);
        let n = entry.regions.len();
        if n == 0 {
            return (0, 0);
        }
        if self.cfg.state_aware {
            let target = self.current_state;
            let mut first = None;
            for (i, r) in entry.regions.iter().enumerate() {
                if r.final_state() == Some(target) {
                    first = Some(i);
                    break;
                }
            }
            if let Some(first) = first {
                let want = entry.regions[first].state_seq.len();
                let mut last = first;
                while last + 1 < n && entry.regions[last + 1].state_seq.len() == want {
                    last += 1;
                }
                return (first, last);
            }
        }
        let first = self.rand.below(n as u64) as usize;
        let last = first + self.rand.below((n - first) as u64) as usize;
        (first, last)
    }

    /// When progress stalls, ask the oracle for a plausible next request
    /// after this seed's M1 prefix and run it once as a speculative probe.
    fn maybe_stall_probe(&mut self, id: QueueId, m2_first: usize) -> Result<(), Error> {
        if self.stats.uninteresting_iters < STALL_THRESHOLD
            || !self.oracle.is_enabled()
            || self.oracle.stall_budget_left() == 0
        {
            return Ok(());
        }
        self.stats.uninteresting_iters = 0;

        let (dialog, prefix, prefix_bounds, current_m2_head) = {
            let entry = self.queue.get(id);
            if entry.regions.is_empty() {
                return Ok(());
            }
            let data = entry.load_input()?;
            let mut dialog = Vec::new();
            for r in &entry.regions[..m2_first] {
                let req = data[r.start..r.end.min(data.len())].to_vec();
                let resp = r
                    .state_seq
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
                    .into_bytes();
                dialog.push((req, resp));
            }
            let m2_start = entry.regions[m2_first].start.min(data.len());
            let head_end = entry.regions[m2_first].end.min(data.len());
            (
                dialog,
                data[..m2_start].to_vec(),
                entry.regions[..m2_first]
                    .iter()
                    .map(|r| r.end)
                    .collect::<Vec<_>>(),
                data[m2_start..head_end].to_vec(),
            )
        };

        let Some(proposal) = self.oracle.propose_next_request(&dialog) else {
            return Ok(());
        };
        if proposal == current_m2_head {
            return Ok(());
        }
        self.stats.stall_probes += 1;
        let mut context = Vec::new();
        for (req, resp) in &dialog {
            context.extend_from_slice(req);
            context.extend_from_slice(b" -> ");
            context.extend_from_slice(resp);
            context.push(b'\n');
        }
        if let Err(e) =
            self.out
                .save_stall_interaction(self.stats.stall_probes, &context, &proposal)
        {
            log::warn!("Cannot record stall interaction: {e}");
        }

        let mut buf = prefix;
        buf.extend_from_slice(&proposal);
        let mut bounds = prefix_bounds;
        bounds.push(buf.len());
        let tag = StageTag {
            name: "stall",
            cur_byte: -1,
            cur_val: -1,
        };
        self.run_trial(&tag, &buf, &bounds)?;
        Ok(())
    }

    /// Fuzz one queue entry against the current target state.
    pub fn fuzz_one(&mut self, id: QueueId) -> Result<(), Error> {
        self.stats.cur_entry = id;
        self.flags.skip_requested.store(false, Ordering::Relaxed);

        let (m2_first, m2_last) = self.select_m2(id);
        self.maybe_stall_probe(id, m2_first)?;

        let entry = self.queue.get(id);
        let data = entry.load_input()?;
        if data.is_empty() {
            return Ok(());
        }
        let bounds: Vec<usize> = if entry.regions.is_empty() {
            vec![data.len()]
        } else {
            entry
                .regions
                .iter()
                .map(|r| r.end.min(data.len()))
                .collect()
        };
        let (m2_start, m2_len) = if entry.regions.is_empty() {
            (0, data.len())
        } else {
            let start = entry.regions[m2_first].start.min(data.len().saturating_sub(1));
            let end = entry.regions[m2_last].end.clamp(start + 1, data.len());
            (start, end - start)
        };
        let base_cksum = entry.exec_cksum;
        let entry_name = entry
            .fname
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let passed_det = entry.passed_det;
        let was_fuzzed_here = entry.was_fuzzed.contains(&self.current_state);
        let ever_fuzzed = !entry.was_fuzzed.is_empty();

        let mut ctx = StageCtx::new(data, bounds, m2_start, m2_len, base_cksum);
        let mut aborted = false;
        let mut ran_deterministic = false;

        // Deterministic stages are one-shot per entry, and sharded across
        // master instances.
        let sharded_out = self.cfg.master_max > 1
            && (id as u32) % self.cfg.master_max != self.cfg.master_id;
        if !self.cfg.skip_deterministic && !passed_det && !ever_fuzzed && !sharded_out {
            let det = deterministic_stages(self, &mut ctx)?;
            aborted = det.aborted;
            ran_deterministic = true;
            if !aborted {
                self.queue.get_mut(id).passed_det = true;
                if let Err(e) = self.out.mark_state("deterministic_done", &entry_name) {
                    log::warn!("Cannot mark deterministic_done: {e}");
                }
            }
        }

        if !aborted && !self.stop_requested() {
            let perf_score = self.queue.calculate_score(
                id,
                self.stats.avg_exec_us(),
                self.stats.avg_bitmap_size(),
            );
            let havoc_div = havoc_div_for(self.stats.avg_exec_us());
            let m2_blob = ctx.out[ctx.m2_start..ctx.m2_start + ctx.m2_len].to_vec();
            let grammar_ranges = self.grammar.parse_buffer(&m2_blob);

            let havoc = havoc_stage(
                self,
                &mut ctx,
                perf_score,
                havoc_div,
                &grammar_ranges,
                false,
                ran_deterministic,
            )?;
            aborted = havoc.aborted;

            // Nothing found: recombine with another entry and try again.
            if !aborted && havoc.new_finds == 0 && self.queue.len() > 1 {
                for _ in 0..SPLICE_CYCLES {
                    if self.stop_requested() {
                        break;
                    }
                    if !splice_m2(self, &mut ctx)? {
                        break;
                    }
                    let blob = ctx.out[ctx.m2_start..ctx.m2_start + ctx.m2_len].to_vec();
                    let ranges = self.grammar.parse_buffer(&blob);
                    let spliced =
                        havoc_stage(self, &mut ctx, perf_score, havoc_div, &ranges, true, false)?;
                    if spliced.aborted || spliced.new_finds > 0 {
                        break;
                    }
                }
            }
        }

        // Iteration bookkeeping, even on abort.
        let target = self.current_state;
        let (favored, newly_fuzzed, fuzzed_states) = {
            let entry = self.queue.get_mut(id);
            let favored = entry.favored;
            let newly_fuzzed = entry.was_fuzzed.insert(target);
            (favored, newly_fuzzed, entry.was_fuzzed.len())
        };
        if newly_fuzzed && !was_fuzzed_here {
            if fuzzed_states == 1 {
                self.queue.pending_not_fuzzed = self.queue.pending_not_fuzzed.saturating_sub(1);
            }
            if favored {
                self.queue.pending_favored = self.queue.pending_favored.saturating_sub(1);
            }
        }
        Ok(())
    }

    /* ---------------- main loop (C12) ---------------- */

    pub fn fuzz_loop(&mut self) -> Result<(), Error> {
        log::info!("Entering the fuzzing loop");
        let mut finds_at_cycle_start = self.queue.len();
        loop {
            if self.stop_requested() {
                break;
            }
            self.maybe_write_outputs();

            if self.cfg.state_aware {
                let target = self
                    .ipsm
                    .choose_target_state(self.cfg.state_selection, &mut self.rand);
                self.current_state = target;
                let redundant_dir = self.out.redundant_edges_dir();
                self.queue.cull(target, Some(redundant_dir.as_path()));
                let id = match self.ipsm.choose_seed(
                    target,
                    &self.queue,
                    &mut self.rand,
                    self.cfg.seed_selection,
                ) {
                    Some(id) => id,
                    None => self.rand.below(self.queue.len() as u64) as usize,
                };
                self.fuzz_one_tolerant(id)?;
            } else {
                let id = self.stats.cur_entry % self.queue.len();
                self.current_state = 0;
                let redundant_dir = self.out.redundant_edges_dir();
                self.queue.cull(0, Some(redundant_dir.as_path()));
                if !self.should_skip_linear(id) {
                    self.fuzz_one_tolerant(id)?;
                }
                if (id + 1) % self.queue.len() == 0 {
                    self.stats.queue_cycle += 1;
                    self.stats.cycles_done += 1;
                    if self.queue.len() == finds_at_cycle_start && self.cfg.exit_when_done {
                        log::info!("Whole cycle without findings, exiting as requested");
                        break;
                    }
                    finds_at_cycle_start = self.queue.len();
                }
                self.stats.cur_entry = (id + 1) % self.queue.len();
            }

            if self.cfg.bench_until_crash && self.stats.unique_crashes > 0 {
                log::info!("First crash found, exiting as requested");
                break;
            }
        }
        self.final_flush();
        Ok(())
    }

    /// AFL-style probabilistic skipping for the linear queue walk.
    fn should_skip_linear(&mut self, id: QueueId) -> bool {
        let entry = self.queue.get(id);
        let fuzzed = entry.was_fuzzed.contains(&self.current_state);
        let favored = entry.favored;
        if self.queue.pending_favored > 0 {
            (fuzzed || !favored) && self.rand.below(100) < 99
        } else if !favored && self.queue.len() > 10 {
            if self.stats.queue_cycle > 0 && !fuzzed {
                self.rand.below(100) < 75
            } else {
                self.rand.below(100) < 95
            }
        } else {
            false
        }
    }

    /// Run one iteration, tolerating the error classes that merely mean
    /// "this sequence went nowhere".
    fn fuzz_one_tolerant(&mut self, id: QueueId) -> Result<(), Error> {
        match self.fuzz_one(id) {
            Ok(()) => Ok(()),
            Err(Error::Unknown(msg, _)) if msg.contains("EINTR") => {
                log::warn!("Interrupted system call, checking stop flag");
                Ok(())
            }
            Err(Error::File(e, _))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::NotConnected
                        | std::io::ErrorKind::TimedOut
                ) =>
            {
                log::debug!("Recoverable connection trouble, moving on: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /* ---------------- periodic output ---------------- */

    fn maybe_write_outputs(&mut self) {
        if self.last_output_at.elapsed() < OUTPUT_INTERVAL {
            return;
        }
        self.last_output_at = Instant::now();
        self.write_outputs();
    }

    fn write_outputs(&mut self) {
        let run_secs = self.start_time.elapsed().as_secs_f64().max(0.001);
        let coverage_pct =
            f64::from(count_non_255_bytes(&self.cov.virgin_bits)) * 100.0 / MAP_SIZE as f64;
        let stats = [
            (
                "start_time",
                unix_time()
                    .saturating_sub(self.start_time.elapsed().as_secs())
                    .to_string(),
            ),
            ("last_update", unix_time().to_string()),
            ("cycles_done", self.stats.cycles_done.to_string()),
            ("execs_done", self.stats.total_execs.to_string()),
            (
                "execs_per_sec",
                format!("{:.2}", self.stats.total_execs as f64 / run_secs),
            ),
            ("paths_total", self.queue.len().to_string()),
            ("cur_path", self.stats.cur_entry.to_string()),
            ("pending_favs", self.queue.pending_favored.to_string()),
            ("pending_total", self.queue.pending_not_fuzzed.to_string()),
            ("bitmap_cvg", format!("{coverage_pct:.2}%")),
            ("unique_crashes", self.stats.unique_crashes.to_string()),
            ("unique_hangs", self.stats.unique_hangs.to_string()),
            ("max_depth", self.queue.max_depth.to_string()),
            ("n_nodes", self.ipsm.n_nodes().to_string()),
            ("n_edges", self.ipsm.n_edges().to_string()),
            ("chat_count", self.oracle.chat_count.to_string()),
            ("exec_timeout", self.exec_timeout.as_millis().to_string()),
        ];
        if let Err(e) = self.out.write_stats(&stats) {
            log::warn!("Cannot write fuzzer_stats: {e}");
        }
        if let Err(e) = self.out.write_bitmap(&self.cov.virgin_bits) {
            log::warn!("Cannot write bitmap snapshot: {e}");
        }
        let row = PlotRow {
            unix_time: unix_time(),
            cycles_done: self.stats.cycles_done,
            cur_path: self.stats.cur_entry,
            paths_total: self.queue.len(),
            pending_total: self.queue.pending_not_fuzzed,
            pending_favs: self.queue.pending_favored,
            coverage_pct,
            unique_crashes: self.stats.unique_crashes,
            unique_hangs: self.stats.unique_hangs,
            max_depth: self.queue.max_depth,
            execs_per_sec: self.stats.total_execs as f64 / run_secs,
            n_nodes: self.ipsm.n_nodes(),
            n_edges: self.ipsm.n_edges(),
            chat_count: self.oracle.chat_count,
        };
        if let Err(e) = self.out.append_plot(&row) {
            log::warn!("Cannot append plot data: {e}");
        }
    }

    /// Flush everything that outlives the process.
    fn final_flush(&mut self) {
        self.write_outputs();
        if let Err(e) = self.out.write_dot(&self.ipsm.to_dot()) {
            log::warn!("Cannot write final ipsm.dot: {e}");
        }
        if let Err(e) = self.dict.save_auto(&self.out.auto_extras_dir()) {
            log::warn!("Cannot save auto extras: {e}");
        }
        log::info!(
            "Session done: {} execs, {} paths, {} states, {} unique crashes, {} unique hangs",
            self.stats.total_execs,
            self.queue.len(),
            self.ipsm.n_nodes(),
            self.stats.unique_crashes,
            self.stats.unique_hangs
        );
    }
}

impl TrialRunner for Fuzzer {
    fn run_trial(
        &mut self,
        stage: &StageTag,
        buf: &[u8],
        bounds: &[usize],
    ) -> Result<TrialFeedback, Error> {
        self.stage_name = stage.name;
        self.stage_cur_byte = stage.cur_byte;
        self.stage_cur_val = stage.cur_val;

        if self.stop_requested() || self.flags.skip_requested.load(Ordering::Relaxed) {
            return Ok(TrialFeedback {
                cksum: 0,
                new_find: false,
                abort: true,
            });
        }

        let (fault, outcome) = self.run_target_sequence(buf, bounds)?;
        let (interesting, _codes) = self.update_state_tracking(&outcome.responses);
        let queued = self.save_if_interesting(
            buf,
            bounds,
            fault,
            &outcome.responses,
            outcome.likely_buggy,
            interesting,
        )?;
        if queued || interesting {
            self.stats.uninteresting_iters = 0;
        } else {
            self.stats.uninteresting_iters += 1;
        }
        self.maybe_write_outputs();

        Ok(TrialFeedback {
            cksum: hash_trace(self.trace.as_slice()),
            new_find: queued,
            abort: self.stop_requested() || self.flags.skip_requested.load(Ordering::Relaxed),
        })
    }

    fn rand_mut(&mut self) -> &mut StdRand {
        &mut self.rand
    }

    fn dictionary(&self) -> &Dictionary {
        &self.dict
    }

    fn add_auto_candidate(&mut self, candidate: &[u8]) {
        self.dict.maybe_add_auto(&mut self.rand, candidate);
    }

    fn donor_region(&mut self) -> Option<Vec<u8>> {
        if self.queue.is_empty() {
            return None;
        }
        let id = self.rand.below(self.queue.len() as u64) as usize;
        let entry = self.queue.get(id);
        if entry.regions.is_empty() {
            return None;
        }
        let r = &entry.regions[self.rand.below(entry.regions.len() as u64) as usize];
        let data = entry.load_input().ok()?;
        if r.start >= data.len() {
            return None;
        }
        Some(data[r.start..r.end.min(data.len())].to_vec())
    }

    fn splice_donor(&mut self, cur: &[u8]) -> Option<Vec<u8>> {
        if self.queue.len() < 2 {
            return None;
        }
        for _ in 0..8 {
            let id = self.rand.below(self.queue.len() as u64) as usize;
            if id == self.stats.cur_entry {
                continue;
            }
            let entry = self.queue.get(id);
            if entry.len < 2 {
                continue;
            }
            let data = entry.load_input().ok()?;
            if mutation::locate_diffs(cur, &data).is_some() {
                return Some(data);
            }
        }
        None
    }

    fn split_messages(&self, blob: &[u8]) -> Vec<usize> {
        self.protocol
            .extract_requests(blob)
            .into_iter()
            .map(|(_, end)| end)
            .collect()
    }

    fn region_mutation_enabled(&self) -> bool {
        self.cfg.region_mutation
    }

    fn queue_cycle(&self) -> u64 {
        self.stats.queue_cycle
    }

    fn run_over_10m(&self) -> bool {
        self.start_time.elapsed() > Duration::from_secs(600)
    }
}

/// Attach per-message state annotations: region `i` carries the codes
/// decoded from the responses accumulated up to message `i`.
pub fn annotate_regions(
    regions: &mut [Region],
    responses: &ResponseBuffer,
    protocol: &dyn ProtocolHandler,
) {
    for (i, region) in regions.iter_mut().enumerate() {
        region.state_seq = protocol.extract_response_codes(responses.upto(i));
    }
}

/// Slow targets get fewer havoc rounds.
fn havoc_div_for(avg_exec_us: f64) -> u32 {
    if avg_exec_us > 50_000.0 {
        10
    } else if avg_exec_us > 20_000.0 {
        5
    } else if avg_exec_us > 10_000.0 {
        2
    } else {
        1
    }
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TextCodeProtocol;

    #[test]
    fn regions_annotate_cumulatively() {
        let mut regions = vec![
            Region {
                start: 0,
                end: 4,
                state_seq: vec![],
            },
            Region {
                start: 4,
                end: 8,
                state_seq: vec![],
            },
        ];
        let responses = ResponseBuffer {
            data: b"220 ok\r\n331 pw\r\n".to_vec(),
            offsets: vec![8, 16],
        };
        annotate_regions(&mut regions, &responses, &TextCodeProtocol);
        assert_eq!(regions[0].state_seq, vec![220]);
        assert_eq!(regions[1].state_seq, vec![220, 331]);
        // The final element is the state reached after the message.
        assert_eq!(regions[1].final_state(), Some(331));
    }

    #[test]
    fn havoc_div_follows_target_speed() {
        assert_eq!(havoc_div_for(100.0), 1);
        assert_eq!(havoc_div_for(15_000.0), 2);
        assert_eq!(havoc_div_for(25_000.0), 5);
        assert_eq!(havoc_div_for(80_000.0), 10);
    }

    #[test]
    fn subslice_search() {
        assert!(contains_subslice(b"USER anonymous", b"USER "));
        assert!(!contains_subslice(b"PASS x", b"USER "));
        assert!(!contains_subslice(b"abc", b""));
    }
}
