//! Bitmap algebra over the edge-hit map shared with the instrumented target.
//!
//! The instrumentation writes one byte of raw hit counts per edge identity.
//! After every execution the map is classified into hit-count buckets in
//! place, and novelty is judged (destructively) against a set of virgin maps
//! that start all-ones and lose bits as behaviour is seen.

use libafl_bolts::{
    shmem::{ShMem, ShMemProvider, UnixShMemProvider},
    AsMutSlice, AsSlice, Error,
};

use crate::bolts::hash64;

/// Size of the coverage map, shared with the instrumentation runtime.
pub const MAP_SIZE_POW2: usize = 16;
pub const MAP_SIZE: usize = 1 << MAP_SIZE_POW2;

/// Environment variable carrying the shared-memory id to the child.
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";

/// Distinguished value the forkserver stub writes into the first map word
/// when it fails to exec the target.
pub const EXEC_FAIL_SIG: u32 = 0xfee1_dead;

/// Hit counts are bucketed so that small variations in loop trip counts do
/// not register as new behaviour: {0, 1, 2, 3, 4-7, 8-15, 16-31, 32-127,
/// 128-255} map onto single bits {0, 1, 2, 4, 8, 16, 32, 64, 128}.
const fn count_class_lookup() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 1usize;
    while i < 256 {
        table[i] = match i {
            1 => 1,
            2 => 2,
            3 => 4,
            4..=7 => 8,
            8..=15 => 16,
            16..=31 => 32,
            32..=127 => 64,
            _ => 128,
        };
        i += 1;
    }
    table
}

static COUNT_CLASS_LOOKUP: [u8; 256] = count_class_lookup();

/// Bucket every byte of the trace in place. Idempotent: every bucket value
/// is a fixed point of the lookup table.
pub fn classify_counts(trace: &mut [u8]) {
    for byte in trace.iter_mut() {
        *byte = COUNT_CLASS_LOOKUP[*byte as usize];
    }
}

/// Check a classified trace against a virgin map, clearing the bits we have
/// now seen. Returns 2 if some previously untouched byte lit up, 1 if only
/// new bits appeared within already-touched bytes, 0 otherwise.
pub fn has_new_bits(virgin: &mut [u8], trace: &[u8]) -> u8 {
    debug_assert_eq!(virgin.len(), trace.len());
    let mut ret = 0u8;
    for (v, &t) in virgin.iter_mut().zip(trace.iter()) {
        if t != 0 && (t & *v) != 0 {
            if ret < 2 {
                ret = if *v == 0xff { 2 } else { 1 };
            }
            *v &= !t;
        }
    }
    ret
}

/// Coarsen a trace to presence/absence before judging crash or timeout
/// uniqueness: any hit becomes 0x80, any miss 0x01.
pub fn simplify_trace(trace: &mut [u8]) {
    for byte in trace.iter_mut() {
        *byte = if *byte != 0 { 0x80 } else { 0x01 };
    }
}

/// Compress an 8-bit map down to one bit per edge. Used to retain trace
/// fingerprints of favored queue entries without keeping full maps around.
pub fn minimize_bits(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len() * 8, src.len());
    for b in dst.iter_mut() {
        *b = 0;
    }
    for (i, &s) in src.iter().enumerate() {
        if s != 0 {
            dst[i >> 3] |= 1 << (i & 7);
        }
    }
}

/// Number of non-zero bytes.
pub fn count_bytes(trace: &[u8]) -> u32 {
    trace.iter().filter(|&&b| b != 0).count() as u32
}

/// Number of set bits.
pub fn count_bits(trace: &[u8]) -> u32 {
    trace.iter().map(|b| b.count_ones()).sum()
}

/// Number of bytes that are not all-ones; coverage indicator for virgin maps.
pub fn count_non_255_bytes(trace: &[u8]) -> u32 {
    trace.iter().filter(|&&b| b != 0xff).count() as u32
}

/// Checksum of a (classified) trace.
pub fn hash_trace(trace: &[u8]) -> u64 {
    hash64(trace)
}

/// The shared-memory coverage map. Owns the kernel segment and the mapping;
/// both go away on drop. The child finds the segment through [`SHM_ENV_VAR`].
pub struct TraceMap {
    _provider: UnixShMemProvider,
    shmem: <UnixShMemProvider as ShMemProvider>::ShMem,
}

impl TraceMap {
    pub fn new() -> Result<Self, Error> {
        let mut provider = UnixShMemProvider::new()?;
        let shmem = provider.new_shmem(MAP_SIZE)?;
        shmem.write_to_env(SHM_ENV_VAR)?;
        Ok(Self {
            _provider: provider,
            shmem,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        self.shmem.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.shmem.as_mut_slice()
    }

    /// Zero the map before requesting an execution.
    pub fn reset(&mut self) {
        self.shmem.as_mut_slice().fill(0);
    }

    /// First 32-bit word, native endian; [`EXEC_FAIL_SIG`] lands here.
    pub fn first_word(&self) -> u32 {
        let s = self.shmem.as_slice();
        u32::from_ne_bytes([s[0], s[1], s[2], s[3]])
    }
}

/// The virgin maps the fuzzer judges novelty against. `session` is reset to
/// all-ones around every execution and only serves to detect whether the
/// server is still producing fresh coverage while we wait for it to go
/// quiet.
pub struct CoverageState {
    pub virgin_bits: Vec<u8>,
    pub virgin_tmout: Vec<u8>,
    pub virgin_crash: Vec<u8>,
    pub session: Vec<u8>,
}

impl CoverageState {
    pub fn new() -> Self {
        Self {
            virgin_bits: vec![0xff; MAP_SIZE],
            virgin_tmout: vec![0xff; MAP_SIZE],
            virgin_crash: vec![0xff; MAP_SIZE],
            session: vec![0xff; MAP_SIZE],
        }
    }

    /// Restore `virgin_bits` from a bitmap snapshot of a previous session.
    pub fn restore_virgin_bits(&mut self, snapshot: &[u8]) -> Result<(), Error> {
        if snapshot.len() != MAP_SIZE {
            return Err(Error::illegal_argument(format!(
                "Bitmap snapshot has wrong size: {} (expected {MAP_SIZE})",
                snapshot.len()
            )));
        }
        self.virgin_bits.copy_from_slice(snapshot);
        Ok(())
    }

    pub fn reset_session(&mut self) {
        self.session.fill(0xff);
    }
}

impl Default for CoverageState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_buckets() {
        let mut t = vec![0u8, 1, 2, 3, 4, 7, 8, 15, 16, 31, 32, 127, 128, 255];
        classify_counts(&mut t);
        assert_eq!(t, vec![0, 1, 2, 4, 8, 8, 16, 16, 32, 32, 64, 64, 128, 128]);
    }

    #[test]
    fn classification_is_idempotent() {
        let mut t: Vec<u8> = (0u16..256).map(|b| b as u8).collect();
        classify_counts(&mut t);
        let once = t.clone();
        classify_counts(&mut t);
        assert_eq!(t, once);
    }

    #[test]
    fn novelty_on_fresh_byte() {
        // Scenario: virgin all-ones, current[42] = 3 before classification.
        let mut virgin = vec![0xffu8; MAP_SIZE];
        let mut trace = vec![0u8; MAP_SIZE];
        trace[42] = 3;
        classify_counts(&mut trace);
        assert_eq!(trace[42], 4);
        assert_eq!(has_new_bits(&mut virgin, &trace), 2);
        assert_eq!(virgin[42], 0xfb);
        // Monotonicity: the same trace never registers twice.
        assert_eq!(has_new_bits(&mut virgin, &trace), 0);
    }

    #[test]
    fn novelty_on_new_bits_in_touched_byte() {
        let mut virgin = vec![0xffu8; MAP_SIZE];
        let mut trace = vec![0u8; MAP_SIZE];
        trace[7] = 1;
        assert_eq!(has_new_bits(&mut virgin, &trace), 2);
        trace[7] = 2;
        assert_eq!(has_new_bits(&mut virgin, &trace), 1);
        assert_eq!(virgin[7], 0xff & !0x03);
    }

    #[test]
    fn simplify_coarsens_to_presence() {
        let mut t = vec![0u8, 1, 200];
        simplify_trace(&mut t);
        assert_eq!(t, vec![0x01, 0x80, 0x80]);
    }

    #[test]
    fn minimize_sets_one_bit_per_edge() {
        let mut src = vec![0u8; MAP_SIZE];
        src[0] = 1;
        src[9] = 128;
        let mut dst = vec![0u8; MAP_SIZE >> 3];
        minimize_bits(&mut dst, &src);
        assert_eq!(dst[0], 0b0000_0001);
        assert_eq!(dst[1], 0b0000_0010);
        assert_eq!(count_bits(&dst), 2);
    }

    #[test]
    fn counting_helpers() {
        let t = vec![0u8, 3, 0, 0xff];
        assert_eq!(count_bytes(&t), 2);
        assert_eq!(count_non_255_bytes(&t), 3);
        assert_eq!(count_bits(&t), 10);
    }
}
