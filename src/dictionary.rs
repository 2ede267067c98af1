//! Dictionary tokens: user-supplied extras and auto-discovered extras
//! harvested from checksum-stable byte runs during the deterministic bit
//! walk.

use std::{fs, path::Path};

use libafl_bolts::{
    rands::{Rand, StdRand},
    Error,
};

use crate::mutation::{INTERESTING_16, INTERESTING_32};

pub const MIN_AUTO_EXTRA: usize = 3;
pub const MAX_AUTO_EXTRA: usize = 32;
/// Number of auto extras actually used by the deterministic stage.
pub const USE_AUTO_EXTRAS: usize = 50;
/// Retention cap; least-hit entries get evicted beyond this.
pub const MAX_AUTO_EXTRAS: usize = USE_AUTO_EXTRAS * 10;
/// Above this many user extras, deterministic overwrites become
/// probabilistic to keep stage time bounded.
pub const MAX_DET_EXTRAS: usize = 200;
/// Longest token accepted from a dictionary directory.
pub const MAX_DICT_FILE: usize = 128;

#[derive(Debug, Clone)]
pub struct ExtraData {
    pub data: Vec<u8>,
    pub hit_count: u32,
}

#[derive(Debug, Default)]
pub struct Dictionary {
    /// User tokens, sorted by size ascending.
    pub extras: Vec<ExtraData>,
    /// Harvested tokens, sorted by hit count descending.
    pub auto_extras: Vec<ExtraData>,
}

fn eq_nocase(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.eq_ignore_ascii_case(y))
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load user tokens from a directory, one file per token.
    pub fn load_extras(&mut self, dir: &Path) -> Result<(), Error> {
        let mut entries: Vec<_> = dir.read_dir()?.filter_map(Result::ok).collect();
        entries.sort_by_key(|e| e.path());
        for entry in entries {
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let data = fs::read(entry.path())?;
            if data.is_empty() || data.len() > MAX_DICT_FILE {
                log::warn!(
                    "Skipping dictionary token {:?} with length {}",
                    entry.path(),
                    data.len()
                );
                continue;
            }
            self.extras.push(ExtraData { data, hit_count: 0 });
        }
        self.extras.sort_by_key(|e| e.data.len());
        log::info!("Loaded {} dictionary tokens", self.extras.len());
        Ok(())
    }

    /// Offer a candidate token discovered during the bit walk. Duplicates
    /// bump hit counts; new tokens evict a random low-hit entry once the
    /// store is full.
    pub fn maybe_add_auto(&mut self, rand: &mut StdRand, candidate: &[u8]) {
        if candidate.len() < MIN_AUTO_EXTRA || candidate.len() > MAX_AUTO_EXTRA {
            return;
        }
        // Tokens indistinguishable from interesting-value overwrites add
        // nothing over the arithmetic stages.
        if candidate.len() == 2 {
            let v = u16::from_le_bytes([candidate[0], candidate[1]]);
            if INTERESTING_16
                .iter()
                .any(|&i| i as u16 == v || (i as u16).swap_bytes() == v)
            {
                return;
            }
        }
        if candidate.len() == 4 {
            let v = u32::from_le_bytes([candidate[0], candidate[1], candidate[2], candidate[3]]);
            if INTERESTING_32
                .iter()
                .any(|&i| i as u32 == v || (i as u32).swap_bytes() == v)
            {
                return;
            }
        }
        if self.extras.iter().any(|e| eq_nocase(&e.data, candidate)) {
            return;
        }
        if let Some(existing) = self
            .auto_extras
            .iter_mut()
            .find(|e| eq_nocase(&e.data, candidate))
        {
            existing.hit_count = existing.hit_count.saturating_add(1);
        } else if self.auto_extras.len() >= MAX_AUTO_EXTRAS {
            // Evict from the least-hit half.
            let lower_start = MAX_AUTO_EXTRAS / 2;
            let victim =
                lower_start + rand.below((MAX_AUTO_EXTRAS - lower_start) as u64) as usize;
            self.auto_extras[victim] = ExtraData {
                data: candidate.to_vec(),
                hit_count: 0,
            };
        } else {
            self.auto_extras.push(ExtraData {
                data: candidate.to_vec(),
                hit_count: 0,
            });
        }
        self.auto_extras.sort_by(|a, b| b.hit_count.cmp(&a.hit_count));
        let used = self.auto_extras.len().min(USE_AUTO_EXTRAS);
        self.auto_extras[..used].sort_by_key(|e| e.data.len());
    }

    /// Persist auto extras so a resumed session keeps its harvest.
    pub fn save_auto(&self, dir: &Path) -> Result<(), Error> {
        for (i, extra) in self.auto_extras.iter().enumerate() {
            fs::write(dir.join(format!("auto_{i:06}")), &extra.data)?;
        }
        Ok(())
    }

    pub fn load_auto(&mut self, dir: &Path) -> Result<(), Error> {
        let mut entries: Vec<_> = dir.read_dir()?.filter_map(Result::ok).collect();
        entries.sort_by_key(|e| e.path());
        for entry in entries {
            let data = fs::read(entry.path())?;
            if (MIN_AUTO_EXTRA..=MAX_AUTO_EXTRA).contains(&data.len()) {
                self.auto_extras.push(ExtraData { data, hit_count: 0 });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_extras_dedup_and_count_hits() {
        let mut dict = Dictionary::new();
        let mut rand = StdRand::with_seed(1);
        dict.maybe_add_auto(&mut rand, b"RETR");
        dict.maybe_add_auto(&mut rand, b"retr");
        assert_eq!(dict.auto_extras.len(), 1);
        assert_eq!(dict.auto_extras[0].hit_count, 1);
    }

    #[test]
    fn auto_extras_respect_length_bounds() {
        let mut dict = Dictionary::new();
        let mut rand = StdRand::with_seed(1);
        dict.maybe_add_auto(&mut rand, b"ab");
        dict.maybe_add_auto(&mut rand, &[b'x'; MAX_AUTO_EXTRA + 1]);
        assert!(dict.auto_extras.is_empty());
    }

    #[test]
    fn eviction_keeps_store_bounded() {
        let mut dict = Dictionary::new();
        let mut rand = StdRand::with_seed(7);
        for i in 0..(MAX_AUTO_EXTRAS + 100) {
            dict.maybe_add_auto(&mut rand, format!("tok{i:04}").as_bytes());
        }
        assert_eq!(dict.auto_extras.len(), MAX_AUTO_EXTRAS);
    }

    #[test]
    fn user_tokens_load_sorted_by_size() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"LONGTOKEN").unwrap();
        fs::write(dir.path().join("b"), b"HI").unwrap();
        let mut dict = Dictionary::new();
        dict.load_extras(dir.path()).unwrap();
        assert_eq!(dict.extras.len(), 2);
        assert_eq!(dict.extras[0].data, b"HI");
    }
}
