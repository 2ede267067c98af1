//! On-disk layout of a fuzzing session: the queue, crash/hang corpora,
//! stats and plot files, the bitmap snapshot, the IPSM dump, and the
//! advisory lock that keeps the directory single-owner.

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use libafl_bolts::Error;
use nix::fcntl::{flock, FlockArg};

use crate::queue::Region;

/// Subdirectories created under the output directory.
const SUBDIRS: &[&str] = &[
    "queue",
    "queue/.state/deterministic_done",
    "queue/.state/auto_extras",
    "queue/.state/redundant_edges",
    "queue/.state/variable_behavior",
    "replayable-crashes",
    "replayable-hangs",
    "replayable-queue",
    "regions",
    "replayable-new-ipsm-paths",
    "responses-ipsm",
    "protocol-grammars",
    "stall-interactions",
];

pub struct OutputDirs {
    base: PathBuf,
    /// Held for the lifetime of the session; the flock dies with it.
    _lock: File,
}

impl OutputDirs {
    /// Prepare the directory tree and take the advisory lock. A non-empty
    /// directory is only accepted when resuming.
    pub fn create(base: &Path, resume: bool) -> Result<Self, Error> {
        if base.exists() {
            if !resume && base.join("fuzzer_stats").exists() {
                return Err(Error::illegal_argument(format!(
                    "Output directory {} holds a previous session; use resume or pick \
                     another one",
                    base.display()
                )));
            }
        } else {
            fs::create_dir_all(base)?;
        }
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(base.join(".cur_input_lock"))?;
        flock(lock.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(|_| {
            Error::illegal_state(format!(
                "Output directory {} is owned by another fuzzer instance",
                base.display()
            ))
        })?;
        for sub in SUBDIRS {
            fs::create_dir_all(base.join(sub))?;
        }
        Ok(Self {
            base: base.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.base.join("queue")
    }

    pub fn redundant_edges_dir(&self) -> PathBuf {
        self.base.join("queue/.state/redundant_edges")
    }

    pub fn auto_extras_dir(&self) -> PathBuf {
        self.base.join("queue/.state/auto_extras")
    }

    pub fn crashes_dir(&self) -> PathBuf {
        self.base.join("replayable-crashes")
    }

    pub fn hangs_dir(&self) -> PathBuf {
        self.base.join("replayable-hangs")
    }

    pub fn replayable_queue_dir(&self) -> PathBuf {
        self.base.join("replayable-queue")
    }

    pub fn regions_dir(&self) -> PathBuf {
        self.base.join("regions")
    }

    pub fn new_ipsm_paths_dir(&self) -> PathBuf {
        self.base.join("replayable-new-ipsm-paths")
    }

    pub fn responses_dir(&self) -> PathBuf {
        self.base.join("responses-ipsm")
    }

    pub fn grammars_dir(&self) -> PathBuf {
        self.base.join("protocol-grammars")
    }

    pub fn stalls_dir(&self) -> PathBuf {
        self.base.join("stall-interactions")
    }

    /// Touch a marker file under `queue/.state/<kind>/`.
    pub fn mark_state(&self, kind: &str, name: &str) -> Result<(), Error> {
        fs::write(self.base.join("queue/.state").join(kind).join(name), [])?;
        Ok(())
    }

    pub fn has_state_mark(&self, kind: &str, name: &str) -> bool {
        self.base.join("queue/.state").join(kind).join(name).exists()
    }

    /* ---------------- stats / plot / bitmap / dot ---------------- */

    /// Rewrite `fuzzer_stats` as line-oriented `key : value`.
    pub fn write_stats(&self, stats: &[(&str, String)]) -> Result<(), Error> {
        let mut writer = BufWriter::new(File::create(self.base.join("fuzzer_stats"))?);
        for (key, value) in stats {
            writeln!(writer, "{key:<18}: {value}")?;
        }
        Ok(())
    }

    /// Read `fuzzer_stats` back for session resume.
    pub fn read_stats(&self) -> Result<HashMap<String, String>, Error> {
        let text = fs::read_to_string(self.base.join("fuzzer_stats"))?;
        let mut map = HashMap::new();
        for line in text.lines() {
            if let Some((k, v)) = line.split_once(':') {
                map.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
        Ok(map)
    }

    /// Append one `plot_data` row, writing the header first on a fresh
    /// file.
    #[allow(clippy::too_many_arguments)]
    pub fn append_plot(&self, row: &PlotRow) -> Result<(), Error> {
        let path = self.base.join("plot_data");
        let fresh = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if fresh {
            writeln!(
                file,
                "# unix_time, cycles_done, cur_path, paths_total, pending_total, \
                 pending_favs, map_size, unique_crashes, unique_hangs, max_depth, \
                 execs_per_sec, n_nodes, n_edges, chat_count"
            )?;
        }
        writeln!(
            file,
            "{}, {}, {}, {}, {}, {}, {:.2}%, {}, {}, {}, {:.2}, {}, {}, {}",
            row.unix_time,
            row.cycles_done,
            row.cur_path,
            row.paths_total,
            row.pending_total,
            row.pending_favs,
            row.coverage_pct,
            row.unique_crashes,
            row.unique_hangs,
            row.max_depth,
            row.execs_per_sec,
            row.n_nodes,
            row.n_edges,
            row.chat_count,
        )?;
        Ok(())
    }

    /// Snapshot of the virgin bitmap.
    pub fn write_bitmap(&self, virgin_bits: &[u8]) -> Result<(), Error> {
        fs::write(self.base.join("fuzz_bitmap"), virgin_bits)?;
        Ok(())
    }

    pub fn read_bitmap(&self) -> Result<Vec<u8>, Error> {
        Ok(fs::read(self.base.join("fuzz_bitmap"))?)
    }

    pub fn write_dot(&self, dot: &str) -> Result<(), Error> {
        fs::write(self.base.join("ipsm.dot"), dot)?;
        Ok(())
    }

    /* ---------------- corpus files ---------------- */

    pub fn queue_entry_path(&self, id: usize, op: &str, new_cov: bool) -> PathBuf {
        let cov = if new_cov { ",+cov" } else { "" };
        self.queue_dir().join(format!("id:{id:06},{op}{cov}"))
    }

    pub fn crash_path(&self, id: usize, sig: i32, src: usize, op: &str) -> PathBuf {
        self.crashes_dir()
            .join(format!("id:{id:06},sig:{sig:02},src:{src:06},{op}"))
    }

    pub fn hang_path(&self, id: usize, src: usize, op: &str) -> PathBuf {
        self.hangs_dir()
            .join(format!("id:{id:06},src:{src:06},{op}"))
    }

    /// Persist a queue entry's region table as CBOR next to the corpus.
    pub fn save_regions(&self, name: &str, regions: &[Region]) -> Result<(), Error> {
        let file = File::create(self.regions_dir().join(name))?;
        ciborium::into_writer(&regions, BufWriter::new(file))
            .map_err(|e| Error::serialize(format!("Cannot write region file: {e}")))?;
        Ok(())
    }

    pub fn load_regions(&self, name: &str) -> Result<Vec<Region>, Error> {
        let file = File::open(self.regions_dir().join(name))?;
        ciborium::from_reader(file)
            .map_err(|e| Error::serialize(format!("Cannot read region file: {e}")))
    }

    /// Keep the raw response buffer that taught us a new state sequence.
    pub fn save_response(&self, name: &str, data: &[u8]) -> Result<(), Error> {
        fs::write(self.responses_dir().join(name), data)?;
        Ok(())
    }

    /// Record one stall-recovery interaction for offline inspection.
    pub fn save_stall_interaction(
        &self,
        index: u32,
        prompt_context: &[u8],
        answer: &[u8],
    ) -> Result<(), Error> {
        fs::write(
            self.stalls_dir().join(format!("stall_{index:06}_context")),
            prompt_context,
        )?;
        fs::write(
            self.stalls_dir().join(format!("stall_{index:06}_answer")),
            answer,
        )?;
        Ok(())
    }
}

/// One `plot_data` row.
pub struct PlotRow {
    pub unix_time: u64,
    pub cycles_done: u64,
    pub cur_path: usize,
    pub paths_total: usize,
    pub pending_total: usize,
    pub pending_favs: usize,
    pub coverage_pct: f64,
    pub unique_crashes: u64,
    pub unique_hangs: u64,
    pub max_depth: u32,
    pub execs_per_sec: f64,
    pub n_nodes: usize,
    pub n_edges: usize,
    pub chat_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_the_whole_layout() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("out");
        let out = OutputDirs::create(&base, false).unwrap();
        for sub in SUBDIRS {
            assert!(base.join(sub).is_dir(), "{sub} missing");
        }
        out.mark_state("deterministic_done", "id:000000,orig:seed").unwrap();
        assert!(out.has_state_mark("deterministic_done", "id:000000,orig:seed"));
    }

    #[test]
    fn stats_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let out = OutputDirs::create(&dir.path().join("out"), false).unwrap();
        out.write_stats(&[
            ("cur_path", "7".to_string()),
            ("exec_timeout", "1000".to_string()),
        ])
        .unwrap();
        let stats = out.read_stats().unwrap();
        assert_eq!(stats["cur_path"], "7");
        assert_eq!(stats["exec_timeout"], "1000");
    }

    #[test]
    fn regions_round_trip_through_cbor() {
        let dir = tempfile::tempdir().unwrap();
        let out = OutputDirs::create(&dir.path().join("out"), false).unwrap();
        let regions = vec![
            Region {
                start: 0,
                end: 5,
                state_seq: vec![220],
            },
            Region {
                start: 5,
                end: 9,
                state_seq: vec![220, 331],
            },
        ];
        out.save_regions("id:000000", &regions).unwrap();
        assert_eq!(out.load_regions("id:000000").unwrap(), regions);
    }

    #[test]
    fn plot_gets_a_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let out = OutputDirs::create(&dir.path().join("out"), false).unwrap();
        let row = PlotRow {
            unix_time: 1,
            cycles_done: 0,
            cur_path: 0,
            paths_total: 1,
            pending_total: 1,
            pending_favs: 0,
            coverage_pct: 0.5,
            unique_crashes: 0,
            unique_hangs: 0,
            max_depth: 0,
            execs_per_sec: 10.0,
            n_nodes: 1,
            n_edges: 0,
            chat_count: 0,
        };
        out.append_plot(&row).unwrap();
        out.append_plot(&row).unwrap();
        let text = fs::read_to_string(dir.path().join("out/plot_data")).unwrap();
        assert_eq!(text.lines().filter(|l| l.starts_with('#')).count(), 1);
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn second_instance_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("out");
        let _first = OutputDirs::create(&base, false).unwrap();
        assert!(OutputDirs::create(&base, true).is_err());
    }

    #[test]
    fn refuses_a_used_directory_without_resume() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("out");
        {
            let out = OutputDirs::create(&base, false).unwrap();
            out.write_stats(&[("cur_path", "0".into())]).unwrap();
        }
        assert!(OutputDirs::create(&base, false).is_err());
        assert!(OutputDirs::create(&base, true).is_ok());
    }
}
