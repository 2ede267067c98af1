//! The mutation engine: deterministic walking stages with an effector map,
//! dictionary stages, structure-aware havoc, and splicing.
//!
//! Stages operate on a working buffer `M1 ‖ M2 ‖ M3` but only ever rewrite
//! the M2 byte range; the prefix and suffix are replayed verbatim around
//! every trial. Execution is abstracted behind [`TrialRunner`] so the stage
//! drivers can be exercised against a mock target.

use libafl_bolts::{
    rands::{Rand, StdRand},
    Error,
};

use crate::{
    dictionary::{Dictionary, MAX_AUTO_EXTRA, MIN_AUTO_EXTRA, MAX_DET_EXTRAS, USE_AUTO_EXTRAS},
    grammar::Range,
    queue::HAVOC_MAX_MULT,
};

pub const ARITH_MAX: u32 = 35;

pub const INTERESTING_8: [i8; 9] = [-128, -1, 0, 1, 16, 32, 64, 100, 127];
pub const INTERESTING_16: [i16; 19] = [
    -128, -1, 0, 1, 16, 32, 64, 100, 127, -32768, -129, 128, 255, 256, 512, 1000, 1024, 4096,
    32767,
];
pub const INTERESTING_32: [i32; 27] = [
    -128,
    -1,
    0,
    1,
    16,
    32,
    64,
    100,
    127,
    -32768,
    -129,
    128,
    255,
    256,
    512,
    1000,
    1024,
    4096,
    32767,
    -2147483648,
    -100663046,
    -32769,
    32768,
    65535,
    65536,
    100663045,
    2147483647,
];

pub const HAVOC_CYCLES: u32 = 256;
pub const HAVOC_CYCLES_INIT: u32 = 1024;
pub const HAVOC_MIN: u32 = 16;
pub const HAVOC_STACK_POW2: u64 = 7;
pub const HAVOC_BLK_SMALL: usize = 32;
pub const HAVOC_BLK_MEDIUM: usize = 128;
pub const HAVOC_BLK_LARGE: usize = 1500;
pub const HAVOC_BLK_XL: usize = 32768;
pub const SPLICE_CYCLES: u32 = 15;
pub const SPLICE_HAVOC: u32 = 32;
/// Probability (%) of ignoring the learned grammar for a havoc round and
/// treating the whole mutation target as one mutable range.
pub const EPSILON_EXPLORE: u64 = 20;
/// Effector coverage (%) beyond which the whole map is considered
/// effective.
pub const EFF_MAX_PERC: usize = 90;
/// Hard cap on generated inputs.
pub const MAX_FILE: usize = 1 << 20;

/// What a single trial told us.
pub struct TrialFeedback {
    /// Checksum of the classified trace.
    pub cksum: u64,
    /// The trial produced new coverage (it was queued or otherwise counted).
    pub new_find: bool,
    /// Stop or skip was requested; unwind the stage.
    pub abort: bool,
}

/// Identifies the mutation that produced a trial, for crash file names.
pub struct StageTag {
    pub name: &'static str,
    pub cur_byte: i64,
    pub cur_val: i64,
}

/// Outcome of a whole stage.
#[derive(Default)]
pub struct StageResult {
    pub aborted: bool,
    pub new_finds: u64,
}

/// The seam between the mutation engine and the execution pipeline.
pub trait TrialRunner {
    /// Deliver one candidate: run the target, classify coverage, save
    /// interesting results.
    fn run_trial(
        &mut self,
        stage: &StageTag,
        buf: &[u8],
        bounds: &[usize],
    ) -> Result<TrialFeedback, Error>;

    fn rand_mut(&mut self) -> &mut StdRand;
    fn dictionary(&self) -> &Dictionary;
    /// Offer an auto-dictionary candidate harvested from the bit walk.
    fn add_auto_candidate(&mut self, candidate: &[u8]);
    /// Bytes of a random region from a random other queue entry.
    fn donor_region(&mut self) -> Option<Vec<u8>>;
    /// A whole other input for splicing, differing from `cur` somewhere.
    fn splice_donor(&mut self, cur: &[u8]) -> Option<Vec<u8>>;
    /// Message end-offsets of a raw blob, via the protocol plug-in.
    fn split_messages(&self, blob: &[u8]) -> Vec<usize>;
    fn region_mutation_enabled(&self) -> bool;
    fn queue_cycle(&self) -> u64;
    fn run_over_10m(&self) -> bool;
}

/// Working state of one fuzzing iteration over one queue entry.
pub struct StageCtx {
    /// `M1 ‖ M2 ‖ M3`.
    pub out: Vec<u8>,
    /// Absolute message end offsets into `out`.
    pub bounds: Vec<usize>,
    pub m2_start: usize,
    pub m2_len: usize,
    /// Checksum of the entry's calibrated trace.
    pub base_cksum: u64,
    /// Effector map over M2 bytes; 1 = flipping this byte moves the trace.
    pub eff: Vec<u8>,
}

impl StageCtx {
    pub fn new(out: Vec<u8>, bounds: Vec<usize>, m2_start: usize, m2_len: usize, base_cksum: u64) -> Self {
        let eff = vec![0u8; m2_len];
        Self {
            out,
            bounds,
            m2_start,
            m2_len,
            base_cksum,
            eff,
        }
    }

    fn m2(&self) -> &[u8] {
        &self.out[self.m2_start..self.m2_start + self.m2_len]
    }
}

/* ---------------------------------------------------------------------- */
/* Reachability predicates: values later stages can already produce are    */
/* skipped to keep the deterministic phase from re-testing duplicates.     */
/* ---------------------------------------------------------------------- */

/// Would `xor_val` be produced by one of the walking bit flips?
pub fn could_be_bitflip(xor_val: u32) -> bool {
    if xor_val == 0 {
        return true;
    }
    let mut val = xor_val;
    let mut shift = 0u32;
    while val & 1 == 0 {
        shift += 1;
        val >>= 1;
    }
    if val == 1 || val == 3 || val == 15 {
        return true;
    }
    if shift % 8 != 0 {
        return false;
    }
    val == 0xff || val == 0xffff || val == 0xffff_ffff
}

/// Would `new` be produced from `old` by an arithmetic stage over `blen`
/// bytes?
pub fn could_be_arith(old: u32, new: u32, blen: usize) -> bool {
    if old == new {
        return true;
    }
    // Single-byte delta.
    let (mut diffs, mut ov, mut nv) = (0u32, 0u8, 0u8);
    for i in 0..blen {
        let a = (old >> (8 * i)) as u8;
        let b = (new >> (8 * i)) as u8;
        if a != b {
            diffs += 1;
            ov = a;
            nv = b;
        }
    }
    if diffs == 1 && (ov.wrapping_sub(nv) as u32 <= ARITH_MAX || nv.wrapping_sub(ov) as u32 <= ARITH_MAX)
    {
        return true;
    }
    if blen == 1 {
        return false;
    }
    // Two-byte delta, either endian.
    let (mut diffs, mut ov, mut nv) = (0u32, 0u16, 0u16);
    for i in 0..blen / 2 {
        let a = (old >> (16 * i)) as u16;
        let b = (new >> (16 * i)) as u16;
        if a != b {
            diffs += 1;
            ov = a;
            nv = b;
        }
    }
    if diffs == 1 {
        if ov.wrapping_sub(nv) as u32 <= ARITH_MAX || nv.wrapping_sub(ov) as u32 <= ARITH_MAX {
            return true;
        }
        let (ov, nv) = (ov.swap_bytes(), nv.swap_bytes());
        if ov.wrapping_sub(nv) as u32 <= ARITH_MAX || nv.wrapping_sub(ov) as u32 <= ARITH_MAX {
            return true;
        }
    }
    if blen == 4 {
        if old.wrapping_sub(new) <= ARITH_MAX || new.wrapping_sub(old) <= ARITH_MAX {
            return true;
        }
        let (o, n) = (old.swap_bytes(), new.swap_bytes());
        if o.wrapping_sub(n) <= ARITH_MAX || n.wrapping_sub(o) <= ARITH_MAX {
            return true;
        }
    }
    false
}

/// Would `new` be produced from `old` by an interesting-value overwrite of
/// narrower width? `check_le` additionally admits same-width LE patterns,
/// as a preparation for the big-endian attempt.
pub fn could_be_interest(old: u32, new: u32, blen: usize, check_le: bool) -> bool {
    if old == new {
        return true;
    }
    for i in 0..blen {
        for &v in &INTERESTING_8 {
            let tval = (old & !(0xffu32 << (8 * i))) | (u32::from(v as u8) << (8 * i));
            if new == tval {
                return true;
            }
        }
    }
    if blen == 2 && !check_le {
        return false;
    }
    if blen > 1 {
        for i in 0..blen - 1 {
            for &v in &INTERESTING_16 {
                let tval = (old & !(0xffffu32 << (8 * i))) | (u32::from(v as u16) << (8 * i));
                if new == tval {
                    return true;
                }
                if blen > 2 {
                    let tval = (old & !(0xffffu32 << (8 * i)))
                        | (u32::from((v as u16).swap_bytes()) << (8 * i));
                    if new == tval {
                        return true;
                    }
                }
            }
        }
    }
    if blen == 4 && check_le {
        for &v in &INTERESTING_32 {
            if new == v as u32 {
                return true;
            }
        }
    }
    false
}

/// Block length for havoc delete/clone/overwrite, with a preference for
/// small blocks early in the run.
pub fn choose_block_len(
    rand: &mut StdRand,
    limit: usize,
    queue_cycle: u64,
    over_10m: bool,
) -> usize {
    if limit == 0 {
        return 0;
    }
    let rlim = if over_10m { queue_cycle.clamp(1, 3) } else { 1 };
    let (mut min, max) = match rand.below(rlim) {
        0 => (1, HAVOC_BLK_SMALL),
        1 => (HAVOC_BLK_SMALL, HAVOC_BLK_MEDIUM),
        _ => {
            if rand.below(10) != 0 {
                (HAVOC_BLK_MEDIUM, HAVOC_BLK_LARGE)
            } else {
                (HAVOC_BLK_LARGE, HAVOC_BLK_XL)
            }
        }
    };
    if min >= limit {
        min = 1;
    }
    min + rand.below((max.min(limit) - min + 1) as u64) as usize
}

/* ---------------------------------------------------------------------- */
/* Buffer surgery that keeps message boundaries consistent.                */
/* ---------------------------------------------------------------------- */

/// Insert bytes inside the message containing `pos` (bytes land in the
/// following message when `pos` sits exactly on a boundary).
fn insert_bytes(buf: &mut Vec<u8>, bounds: &mut [usize], pos: usize, bytes: &[u8]) {
    buf.splice(pos..pos, bytes.iter().copied());
    for b in bounds.iter_mut() {
        if *b > pos {
            *b += bytes.len();
        }
    }
}

/// Delete `[pos, pos + del)`; boundaries inside the hole collapse onto it.
fn delete_bytes(buf: &mut Vec<u8>, bounds: &mut [usize], pos: usize, del: usize) {
    buf.drain(pos..pos + del);
    for b in bounds.iter_mut() {
        if *b >= pos + del {
            *b -= del;
        } else if *b > pos {
            *b = pos;
        }
    }
}

/// Insert a brand new message of `bytes` whose span starts at the boundary
/// `pos`.
fn insert_message(buf: &mut Vec<u8>, bounds: &mut Vec<usize>, pos: usize, bytes: &[u8]) {
    buf.splice(pos..pos, bytes.iter().copied());
    for b in bounds.iter_mut() {
        if *b > pos {
            *b += bytes.len();
        }
    }
    let idx = bounds.partition_point(|&b| b <= pos);
    bounds.insert(idx, pos + bytes.len());
}

/// Replace the message `[start, end)` with `rep`.
fn replace_span(buf: &mut Vec<u8>, bounds: &mut [usize], start: usize, end: usize, rep: &[u8]) {
    buf.splice(start..end, rep.iter().copied());
    let new_end = start + rep.len();
    for b in bounds.iter_mut() {
        if *b >= end {
            *b = *b - end + new_end;
        } else if *b > start {
            *b = (*b).min(new_end);
        }
    }
}

fn ranges_insert(ranges: &mut [Range], pos: usize, len: usize) {
    for r in ranges.iter_mut() {
        if r.start > pos {
            r.start += len;
        } else if r.end() > pos {
            r.len += len;
        }
    }
}

fn ranges_delete(ranges: &mut [Range], pos: usize, del: usize) {
    let end = pos + del;
    for r in ranges.iter_mut() {
        let r_end = r.end();
        if r.start >= end {
            r.start -= del;
        } else if r_end > pos {
            let overlap = r_end.min(end) - r.start.max(pos);
            r.len -= overlap;
            if r.start > pos {
                r.start = pos;
            }
        }
    }
}

/// First and last differing byte offsets within the overlap, if any.
pub fn locate_diffs(a: &[u8], b: &[u8]) -> Option<(usize, usize)> {
    let len = a.len().min(b.len());
    let mut first = None;
    let mut last = None;
    for i in 0..len {
        if a[i] != b[i] {
            if first.is_none() {
                first = Some(i);
            }
            last = Some(i);
        }
    }
    match (first, last) {
        (Some(f), Some(l)) => Some((f, l)),
        _ => None,
    }
}

/* ---------------------------------------------------------------------- */
/* Deterministic stages.                                                   */
/* ---------------------------------------------------------------------- */

macro_rules! trial {
    ($fz:expr, $ctx:expr, $result:expr, $name:expr, $byte:expr, $val:expr) => {{
        let fb = $fz.run_trial(
            &StageTag {
                name: $name,
                cur_byte: $byte as i64,
                cur_val: $val as i64,
            },
            &$ctx.out,
            &$ctx.bounds,
        )?;
        if fb.new_find {
            $result.new_finds += 1;
        }
        if fb.abort {
            $result.aborted = true;
        }
        fb
    }};
}

fn flip_bit(buf: &mut [u8], bit: usize) {
    buf[bit >> 3] ^= 128 >> (bit & 7);
}

/// Walking 1-, 2- and 4-bit flips; the 1-bit pass doubles as the
/// auto-dictionary harvester.
fn stage_bitflips<R: TrialRunner>(
    fz: &mut R,
    ctx: &mut StageCtx,
) -> Result<StageResult, Error> {
    let mut result = StageResult::default();
    let m2_bits = ctx.m2_len * 8;

    // flip1, collecting checksum-stable runs as dictionary candidates.
    let mut a_collect: Vec<u8> = Vec::new();
    let mut prev_cksum = ctx.base_cksum;
    for bit in 0..m2_bits {
        let abs_bit = ctx.m2_start * 8 + bit;
        flip_bit(&mut ctx.out, abs_bit);
        let fb = trial!(fz, ctx, result, "flip1", bit >> 3, 1);
        flip_bit(&mut ctx.out, abs_bit);
        if result.aborted {
            return Ok(result);
        }

        if bit & 7 == 7 {
            let byte = ctx.m2()[bit >> 3];
            if bit == m2_bits - 1 && fb.cksum == prev_cksum {
                if a_collect.len() < MAX_AUTO_EXTRA {
                    a_collect.push(byte);
                }
                if a_collect.len() >= MIN_AUTO_EXTRA {
                    fz.add_auto_candidate(&a_collect);
                }
            }
            if fb.cksum != prev_cksum {
                if (MIN_AUTO_EXTRA..=MAX_AUTO_EXTRA).contains(&a_collect.len()) {
                    fz.add_auto_candidate(&a_collect);
                }
                a_collect.clear();
                prev_cksum = fb.cksum;
            }
            if fb.cksum != ctx.base_cksum && a_collect.len() < MAX_AUTO_EXTRA {
                a_collect.push(byte);
            }
        }
    }

    for (name, width) in [("flip2", 2usize), ("flip4", 4usize)] {
        if m2_bits < width {
            continue;
        }
        for bit in 0..=(m2_bits - width) {
            let abs_bit = ctx.m2_start * 8 + bit;
            for w in 0..width {
                flip_bit(&mut ctx.out, abs_bit + w);
            }
            trial!(fz, ctx, result, name, bit >> 3, width);
            for w in 0..width {
                flip_bit(&mut ctx.out, abs_bit + w);
            }
            if result.aborted {
                return Ok(result);
            }
        }
    }
    Ok(result)
}

/// Walking byte, word and dword flips. The byte pass populates the
/// effector map; the wider passes consult it.
fn stage_byteflips<R: TrialRunner>(
    fz: &mut R,
    ctx: &mut StageCtx,
) -> Result<StageResult, Error> {
    let mut result = StageResult::default();

    let mut eff_cnt = 0usize;
    for i in 0..ctx.m2_len {
        let abs = ctx.m2_start + i;
        ctx.out[abs] ^= 0xff;
        let fb = trial!(fz, ctx, result, "flip8", i, 8);
        ctx.out[abs] ^= 0xff;
        if result.aborted {
            return Ok(result);
        }
        if ctx.eff[i] == 0 && fb.cksum != ctx.base_cksum {
            ctx.eff[i] = 1;
            eff_cnt += 1;
        }
    }
    // A near-total effector map carries no signal; treat everything as
    // worth touching.
    if eff_cnt != ctx.m2_len && eff_cnt * 100 / ctx.m2_len.max(1) > EFF_MAX_PERC {
        ctx.eff.fill(1);
    }

    if ctx.m2_len >= 2 {
        for i in 0..ctx.m2_len - 1 {
            if ctx.eff[i] == 0 && ctx.eff[i + 1] == 0 {
                continue;
            }
            let abs = ctx.m2_start + i;
            ctx.out[abs] ^= 0xff;
            ctx.out[abs + 1] ^= 0xff;
            trial!(fz, ctx, result, "flip16", i, 16);
            ctx.out[abs] ^= 0xff;
            ctx.out[abs + 1] ^= 0xff;
            if result.aborted {
                return Ok(result);
            }
        }
    }
    if ctx.m2_len >= 4 {
        for i in 0..ctx.m2_len - 3 {
            if ctx.eff[i..i + 4].iter().all(|&e| e == 0) {
                continue;
            }
            let abs = ctx.m2_start + i;
            for w in 0..4 {
                ctx.out[abs + w] ^= 0xff;
            }
            trial!(fz, ctx, result, "flip32", i, 32);
            for w in 0..4 {
                ctx.out[abs + w] ^= 0xff;
            }
            if result.aborted {
                return Ok(result);
            }
        }
    }
    Ok(result)
}

fn stage_arith<R: TrialRunner>(fz: &mut R, ctx: &mut StageCtx) -> Result<StageResult, Error> {
    let mut result = StageResult::default();

    // 8-bit.
    for i in 0..ctx.m2_len {
        if ctx.eff[i] == 0 {
            continue;
        }
        let abs = ctx.m2_start + i;
        let orig = ctx.out[abs];
        for j in 1..=ARITH_MAX {
            let j8 = j as u8;
            let plus = orig.wrapping_add(j8);
            if !could_be_bitflip(u32::from(orig ^ plus)) {
                ctx.out[abs] = plus;
                trial!(fz, ctx, result, "arith8", i, j as i64);
                ctx.out[abs] = orig;
                if result.aborted {
                    return Ok(result);
                }
            }
            let minus = orig.wrapping_sub(j8);
            if !could_be_bitflip(u32::from(orig ^ minus)) {
                ctx.out[abs] = minus;
                trial!(fz, ctx, result, "arith8", i, -(j as i64));
                ctx.out[abs] = orig;
                if result.aborted {
                    return Ok(result);
                }
            }
        }
    }

    // 16-bit, both endians; only deltas that actually touch two bytes.
    if ctx.m2_len >= 2 {
        for i in 0..ctx.m2_len - 1 {
            if ctx.eff[i] == 0 && ctx.eff[i + 1] == 0 {
                continue;
            }
            let abs = ctx.m2_start + i;
            let orig_le = u16::from_le_bytes([ctx.out[abs], ctx.out[abs + 1]]);
            let orig_be = u16::from_be_bytes([ctx.out[abs], ctx.out[abs + 1]]);
            for j in 1..=ARITH_MAX as u16 {
                for (endian, orig, carry) in [
                    ("le", orig_le, (orig_le & 0xff) as u32),
                    ("be", orig_be, (orig_be & 0xff) as u32),
                ] {
                    let plus = orig.wrapping_add(j);
                    let minus = orig.wrapping_sub(j);
                    let emit = |fzr: &mut R, ctx: &mut StageCtx, result: &mut StageResult, val: u16, signed: i64| -> Result<(), Error> {
                        let bytes = if endian == "le" {
                            val.to_le_bytes()
                        } else {
                            val.to_be_bytes()
                        };
                        let old = [ctx.out[abs], ctx.out[abs + 1]];
                        ctx.out[abs] = bytes[0];
                        ctx.out[abs + 1] = bytes[1];
                        let fb = fzr.run_trial(
                            &StageTag {
                                name: "arith16",
                                cur_byte: i as i64,
                                cur_val: signed,
                            },
                            &ctx.out,
                            &ctx.bounds,
                        )?;
                        if fb.new_find {
                            result.new_finds += 1;
                        }
                        if fb.abort {
                            result.aborted = true;
                        }
                        ctx.out[abs] = old[0];
                        ctx.out[abs + 1] = old[1];
                        Ok(())
                    };
                    // Adding within the low byte is already covered by the
                    // 8-bit pass.
                    if carry + u32::from(j) > 0xff
                        && !could_be_bitflip(u32::from(orig ^ plus))
                    {
                        emit(fz, ctx, &mut result, plus, i64::from(j))?;
                        if result.aborted {
                            return Ok(result);
                        }
                    }
                    if carry < u32::from(j) && !could_be_bitflip(u32::from(orig ^ minus)) {
                        emit(fz, ctx, &mut result, minus, -i64::from(j))?;
                        if result.aborted {
                            return Ok(result);
                        }
                    }
                }
            }
        }
    }

    // 32-bit, both endians.
    if ctx.m2_len >= 4 {
        for i in 0..ctx.m2_len - 3 {
            if ctx.eff[i..i + 4].iter().all(|&e| e == 0) {
                continue;
            }
            let abs = ctx.m2_start + i;
            let word = [
                ctx.out[abs],
                ctx.out[abs + 1],
                ctx.out[abs + 2],
                ctx.out[abs + 3],
            ];
            let orig_le = u32::from_le_bytes(word);
            let orig_be = u32::from_be_bytes(word);
            for j in 1..=ARITH_MAX {
                for (is_le, orig, low) in [
                    (true, orig_le, orig_le & 0xffff),
                    (false, orig_be, orig_be & 0xffff),
                ] {
                    let plus = orig.wrapping_add(j);
                    let minus = orig.wrapping_sub(j);
                    let emit = |fzr: &mut R, ctx: &mut StageCtx, result: &mut StageResult, val: u32, signed: i64| -> Result<(), Error> {
                        let bytes = if is_le {
                            val.to_le_bytes()
                        } else {
                            val.to_be_bytes()
                        };
                        let old = [
                            ctx.out[abs],
                            ctx.out[abs + 1],
                            ctx.out[abs + 2],
                            ctx.out[abs + 3],
                        ];
                        ctx.out[abs..abs + 4].copy_from_slice(&bytes);
                        let fb = fzr.run_trial(
                            &StageTag {
                                name: "arith32",
                                cur_byte: i as i64,
                                cur_val: signed,
                            },
                            &ctx.out,
                            &ctx.bounds,
                        )?;
                        if fb.new_find {
                            result.new_finds += 1;
                        }
                        if fb.abort {
                            result.aborted = true;
                        }
                        ctx.out[abs..abs + 4].copy_from_slice(&old);
                        Ok(())
                    };
                    if low + j > 0xffff && !could_be_bitflip(orig ^ plus) {
                        emit(fz, ctx, &mut result, plus, i64::from(j))?;
                        if result.aborted {
                            return Ok(result);
                        }
                    }
                    if low < j && !could_be_bitflip(orig ^ minus) {
                        emit(fz, ctx, &mut result, minus, -i64::from(j))?;
                        if result.aborted {
                            return Ok(result);
                        }
                    }
                }
            }
        }
    }
    Ok(result)
}

fn stage_interest<R: TrialRunner>(fz: &mut R, ctx: &mut StageCtx) -> Result<StageResult, Error> {
    let mut result = StageResult::default();

    for i in 0..ctx.m2_len {
        if ctx.eff[i] == 0 {
            continue;
        }
        let abs = ctx.m2_start + i;
        let orig = ctx.out[abs];
        for &v in &INTERESTING_8 {
            let v = v as u8;
            if could_be_bitflip(u32::from(orig ^ v))
                || could_be_arith(u32::from(orig), u32::from(v), 1)
            {
                continue;
            }
            ctx.out[abs] = v;
            trial!(fz, ctx, result, "int8", i, v as i8 as i64);
            ctx.out[abs] = orig;
            if result.aborted {
                return Ok(result);
            }
        }
    }

    if ctx.m2_len >= 2 {
        for i in 0..ctx.m2_len - 1 {
            if ctx.eff[i] == 0 && ctx.eff[i + 1] == 0 {
                continue;
            }
            let abs = ctx.m2_start + i;
            let old = [ctx.out[abs], ctx.out[abs + 1]];
            let orig = u16::from_le_bytes(old);
            for &v in &INTERESTING_16 {
                let vle = v as u16;
                for (bytes, signed, le) in [
                    (vle.to_le_bytes(), i64::from(v), true),
                    (vle.to_be_bytes(), i64::from(v), false),
                ] {
                    // The BE form is redundant when both spell the same.
                    if !le && bytes == vle.to_le_bytes() {
                        continue;
                    }
                    let as_seen = u16::from_le_bytes(bytes);
                    if could_be_bitflip(u32::from(orig ^ as_seen))
                        || could_be_arith(u32::from(orig), u32::from(as_seen), 2)
                        || could_be_interest(u32::from(orig), u32::from(as_seen), 2, !le)
                    {
                        continue;
                    }
                    ctx.out[abs] = bytes[0];
                    ctx.out[abs + 1] = bytes[1];
                    trial!(fz, ctx, result, "int16", i, signed);
                    ctx.out[abs] = old[0];
                    ctx.out[abs + 1] = old[1];
                    if result.aborted {
                        return Ok(result);
                    }
                }
            }
        }
    }

    if ctx.m2_len >= 4 {
        for i in 0..ctx.m2_len - 3 {
            if ctx.eff[i..i + 4].iter().all(|&e| e == 0) {
                continue;
            }
            let abs = ctx.m2_start + i;
            let old = [
                ctx.out[abs],
                ctx.out[abs + 1],
                ctx.out[abs + 2],
                ctx.out[abs + 3],
            ];
            let orig = u32::from_le_bytes(old);
            for &v in &INTERESTING_32 {
                let vle = v as u32;
                for (bytes, le) in [(vle.to_le_bytes(), true), (vle.to_be_bytes(), false)] {
                    if !le && bytes == vle.to_le_bytes() {
                        continue;
                    }
                    let as_seen = u32::from_le_bytes(bytes);
                    if could_be_bitflip(orig ^ as_seen)
                        || could_be_arith(orig, as_seen, 4)
                        || could_be_interest(orig, as_seen, 4, !le)
                    {
                        continue;
                    }
                    ctx.out[abs..abs + 4].copy_from_slice(&bytes);
                    trial!(fz, ctx, result, "int32", i, i64::from(v));
                    ctx.out[abs..abs + 4].copy_from_slice(&old);
                    if result.aborted {
                        return Ok(result);
                    }
                }
            }
        }
    }
    Ok(result)
}

fn stage_extras<R: TrialRunner>(fz: &mut R, ctx: &mut StageCtx) -> Result<StageResult, Error> {
    let mut result = StageResult::default();
    let extras_cnt = fz.dictionary().extras.len();

    // Overwrite with user extras, size-sorted; probabilistic above the cap.
    for i in 0..ctx.m2_len {
        for ex in 0..extras_cnt {
            if extras_cnt > MAX_DET_EXTRAS
                && fz.rand_mut().below(extras_cnt as u64) >= MAX_DET_EXTRAS as u64
            {
                continue;
            }
            let token = fz.dictionary().extras[ex].data.clone();
            if token.len() > ctx.m2_len - i
                || ctx.m2()[i..i + token.len()] == token[..]
                || !ctx.eff[i..i + token.len()].iter().any(|&e| e != 0)
            {
                continue;
            }
            let abs = ctx.m2_start + i;
            let saved: Vec<u8> = ctx.out[abs..abs + token.len()].to_vec();
            ctx.out[abs..abs + token.len()].copy_from_slice(&token);
            trial!(fz, ctx, result, "ext_UO", i, ex as i64);
            ctx.out[abs..abs + token.len()].copy_from_slice(&saved);
            if result.aborted {
                return Ok(result);
            }
        }
    }

    // Insert user extras at every gap inside M2.
    for i in 0..ctx.m2_len {
        for ex in 0..extras_cnt {
            let token = fz.dictionary().extras[ex].data.clone();
            if ctx.out.len() + token.len() > MAX_FILE {
                continue;
            }
            let mut buf = ctx.out.clone();
            let mut bounds = ctx.bounds.clone();
            insert_bytes(&mut buf, &mut bounds, ctx.m2_start + i, &token);
            let fb = fz.run_trial(
                &StageTag {
                    name: "ext_UI",
                    cur_byte: i as i64,
                    cur_val: ex as i64,
                },
                &buf,
                &bounds,
            )?;
            if fb.new_find {
                result.new_finds += 1;
            }
            if fb.abort {
                result.aborted = true;
                return Ok(result);
            }
        }
    }

    // Overwrite with the best auto extras.
    let auto_cnt = fz.dictionary().auto_extras.len().min(USE_AUTO_EXTRAS);
    for i in 0..ctx.m2_len {
        for ex in 0..auto_cnt {
            let token = fz.dictionary().auto_extras[ex].data.clone();
            if token.len() > ctx.m2_len - i
                || ctx.m2()[i..i + token.len()] == token[..]
                || !ctx.eff[i..i + token.len()].iter().any(|&e| e != 0)
            {
                continue;
            }
            let abs = ctx.m2_start + i;
            let saved: Vec<u8> = ctx.out[abs..abs + token.len()].to_vec();
            ctx.out[abs..abs + token.len()].copy_from_slice(&token);
            trial!(fz, ctx, result, "ext_AO", i, ex as i64);
            ctx.out[abs..abs + token.len()].copy_from_slice(&saved);
            if result.aborted {
                return Ok(result);
            }
        }
    }
    Ok(result)
}

/// All deterministic passes, in order. The caller restores nothing; every
/// pass leaves `ctx.out` exactly as it found it.
pub fn deterministic_stages<R: TrialRunner>(
    fz: &mut R,
    ctx: &mut StageCtx,
) -> Result<StageResult, Error> {
    let mut total = StageResult::default();
    for stage in [
        stage_bitflips::<R>,
        stage_byteflips::<R>,
        stage_arith::<R>,
        stage_interest::<R>,
        stage_extras::<R>,
    ] {
        let r = stage(fz, ctx)?;
        total.new_finds += r.new_finds;
        if r.aborted {
            total.aborted = true;
            return Ok(total);
        }
    }
    Ok(total)
}

/* ---------------------------------------------------------------------- */
/* Havoc.                                                                  */
/* ---------------------------------------------------------------------- */

/// Pick a position inside a random mutable range that can fit `need` bytes.
fn pick_mutable_pos(
    rand: &mut StdRand,
    ranges: &[Range],
    m2_len: usize,
    need: usize,
) -> Option<usize> {
    if m2_len < need || need == 0 {
        return None;
    }
    let candidates: Vec<&Range> = ranges
        .iter()
        .filter(|r| r.mutable && r.len >= need && r.start + need <= m2_len)
        .collect();
    if candidates.is_empty() {
        return None;
    }
    let r = candidates[rand.below(candidates.len() as u64) as usize];
    let max_start = (r.end().min(m2_len)) - need;
    let span = max_start - r.start + 1;
    Some(r.start + rand.below(span as u64) as usize)
}

/// Message index spans `[start, end)` that make up M2 in the current
/// bounds.
fn m2_message_spans(bounds: &[usize], m2_start: usize, m2_len: usize) -> Vec<(usize, usize)> {
    let m2_end = m2_start + m2_len;
    let mut spans = Vec::new();
    let mut prev = 0usize;
    for &b in bounds {
        if prev >= m2_start && b <= m2_end && b > prev {
            spans.push((prev, b));
        }
        prev = b;
    }
    if spans.is_empty() && m2_len > 0 {
        spans.push((m2_start, m2_end));
    }
    spans
}

/// The stacked random-mutation stage. `grammar_ranges` is the exploit-mode
/// decomposition of the M2 blob (offsets relative to M2).
pub fn havoc_stage<R: TrialRunner>(
    fz: &mut R,
    ctx: &mut StageCtx,
    perf_score: u32,
    havoc_div: u32,
    grammar_ranges: &[Range],
    splice_round: bool,
    after_deterministic: bool,
) -> Result<StageResult, Error> {
    let mut result = StageResult::default();
    if ctx.m2_len == 0 {
        return Ok(result);
    }

    let base = if splice_round {
        SPLICE_HAVOC
    } else if after_deterministic {
        HAVOC_CYCLES_INIT
    } else {
        HAVOC_CYCLES
    };
    let mut perf = perf_score;
    let mut stage_max =
        ((u64::from(base) * u64::from(perf) / u64::from(havoc_div.max(1)) / 100) as u32)
            .max(HAVOC_MIN);

    // Exploration ignores the learned structure for this whole round.
    let explore = fz.rand_mut().below(100) < EPSILON_EXPLORE || grammar_ranges.is_empty();
    let base_ranges: Vec<Range> = if explore {
        vec![Range {
            start: 0,
            len: ctx.m2_len,
            mutable: true,
        }]
    } else {
        grammar_ranges.to_vec()
    };

    let mut trial_no = 0u32;
    while trial_no < stage_max {
        trial_no += 1;
        let mut buf = ctx.out.clone();
        let mut bounds = ctx.bounds.clone();
        let mut m2_len = ctx.m2_len;
        let mut ranges = base_ranges.clone();
        let stack = 1u64 << (1 + fz.rand_mut().below(HAVOC_STACK_POW2));

        for _ in 0..stack {
            havoc_one(fz, &mut buf, &mut bounds, ctx.m2_start, &mut m2_len, &mut ranges)?;
            if buf.len() > MAX_FILE {
                break;
            }
        }

        let fb = fz.run_trial(
            &StageTag {
                name: if splice_round { "splice" } else { "havoc" },
                cur_byte: -1,
                cur_val: -1,
            },
            &buf,
            &bounds,
        )?;
        if fb.abort {
            result.aborted = true;
            return Ok(result);
        }
        if fb.new_find {
            result.new_finds += 1;
            // A productive trial earns the stage a bigger budget.
            if perf <= HAVOC_MAX_MULT * 100 {
                stage_max *= 2;
                perf *= 2;
            }
        }
    }
    Ok(result)
}

/// One stacked havoc operation applied in place.
fn havoc_one<R: TrialRunner>(
    fz: &mut R,
    buf: &mut Vec<u8>,
    bounds: &mut Vec<usize>,
    m2_start: usize,
    m2_len: &mut usize,
    ranges: &mut Vec<Range>,
) -> Result<(), Error> {
    if *m2_len == 0 {
        return Ok(());
    }
    let region_ops = fz.region_mutation_enabled();
    let n_ops = if region_ops { 19 } else { 16 };
    let op = fz.rand_mut().below(n_ops);
    let queue_cycle = fz.queue_cycle();
    let over_10m = fz.run_over_10m();

    match op {
        // Flip a single bit somewhere mutable.
        0 => {
            if let Some(pos) = pick_mutable_pos(fz.rand_mut(), ranges, *m2_len, 1) {
                let bit = fz.rand_mut().below(8) as usize;
                buf[m2_start + pos] ^= 128 >> bit;
            }
        }
        // Interesting value overwrites, random endian.
        1 => {
            if let Some(pos) = pick_mutable_pos(fz.rand_mut(), ranges, *m2_len, 1) {
                let v = *fz.rand_mut().choose(&INTERESTING_8) as u8;
                buf[m2_start + pos] = v;
            }
        }
        2 => {
            if let Some(pos) = pick_mutable_pos(fz.rand_mut(), ranges, *m2_len, 2) {
                let v = *fz.rand_mut().choose(&INTERESTING_16) as u16;
                let bytes = if fz.rand_mut().below(2) == 0 {
                    v.to_le_bytes()
                } else {
                    v.to_be_bytes()
                };
                buf[m2_start + pos..m2_start + pos + 2].copy_from_slice(&bytes);
            }
        }
        3 => {
            if let Some(pos) = pick_mutable_pos(fz.rand_mut(), ranges, *m2_len, 4) {
                let v = *fz.rand_mut().choose(&INTERESTING_32) as u32;
                let bytes = if fz.rand_mut().below(2) == 0 {
                    v.to_le_bytes()
                } else {
                    v.to_be_bytes()
                };
                buf[m2_start + pos..m2_start + pos + 4].copy_from_slice(&bytes);
            }
        }
        // Arithmetic, every width, random endian.
        4 | 5 => {
            if let Some(pos) = pick_mutable_pos(fz.rand_mut(), ranges, *m2_len, 1) {
                let delta = 1 + fz.rand_mut().below(u64::from(ARITH_MAX)) as u8;
                let abs = m2_start + pos;
                buf[abs] = if op == 4 {
                    buf[abs].wrapping_sub(delta)
                } else {
                    buf[abs].wrapping_add(delta)
                };
            }
        }
        6 | 7 => {
            if let Some(pos) = pick_mutable_pos(fz.rand_mut(), ranges, *m2_len, 2) {
                let abs = m2_start + pos;
                let delta = 1 + fz.rand_mut().below(u64::from(ARITH_MAX)) as u16;
                let le = fz.rand_mut().below(2) == 0;
                let old = if le {
                    u16::from_le_bytes([buf[abs], buf[abs + 1]])
                } else {
                    u16::from_be_bytes([buf[abs], buf[abs + 1]])
                };
                let new = if op == 6 {
                    old.wrapping_sub(delta)
                } else {
                    old.wrapping_add(delta)
                };
                let bytes = if le { new.to_le_bytes() } else { new.to_be_bytes() };
                buf[abs..abs + 2].copy_from_slice(&bytes);
            }
        }
        8 | 9 => {
            if let Some(pos) = pick_mutable_pos(fz.rand_mut(), ranges, *m2_len, 4) {
                let abs = m2_start + pos;
                let delta = 1 + fz.rand_mut().below(u64::from(ARITH_MAX));
                let le = fz.rand_mut().below(2) == 0;
                let word = [buf[abs], buf[abs + 1], buf[abs + 2], buf[abs + 3]];
                let old = if le {
                    u32::from_le_bytes(word)
                } else {
                    u32::from_be_bytes(word)
                };
                let new = if op == 8 {
                    old.wrapping_sub(delta as u32)
                } else {
                    old.wrapping_add(delta as u32)
                };
                let bytes = if le { new.to_le_bytes() } else { new.to_be_bytes() };
                buf[abs..abs + 4].copy_from_slice(&bytes);
            }
        }
        // Random byte xor; never a no-op.
        10 => {
            if let Some(pos) = pick_mutable_pos(fz.rand_mut(), ranges, *m2_len, 1) {
                let x = 1 + fz.rand_mut().below(255) as u8;
                buf[m2_start + pos] ^= x;
            }
        }
        // Delete a block.
        11 => {
            if *m2_len >= 2 {
                let del = choose_block_len(fz.rand_mut(), *m2_len - 1, queue_cycle, over_10m);
                if let Some(pos) = pick_mutable_pos(fz.rand_mut(), ranges, *m2_len, del) {
                    delete_bytes(buf, bounds, m2_start + pos, del);
                    ranges_delete(ranges, pos, del);
                    *m2_len -= del;
                }
            }
        }
        // Clone bytes (75%) or insert a constant block (25%).
        12 => {
            if buf.len() < MAX_FILE {
                let clone_len = choose_block_len(fz.rand_mut(), *m2_len, queue_cycle, over_10m);
                if clone_len > 0 {
                    let insert_at = fz.rand_mut().below(*m2_len as u64) as usize;
                    let block: Vec<u8> = if fz.rand_mut().below(4) != 0 {
                        let from = pick_mutable_pos(fz.rand_mut(), ranges, *m2_len, clone_len);
                        match from {
                            Some(f) => {
                                buf[m2_start + f..m2_start + f + clone_len].to_vec()
                            }
                            None => return Ok(()),
                        }
                    } else {
                        let fill = if fz.rand_mut().below(2) == 0 {
                            fz.rand_mut().below(256) as u8
                        } else {
                            let p = fz.rand_mut().below(*m2_len as u64) as usize;
                            buf[m2_start + p]
                        };
                        vec![fill; clone_len]
                    };
                    insert_bytes(buf, bounds, m2_start + insert_at, &block);
                    ranges_insert(ranges, insert_at, block.len());
                    *m2_len += block.len();
                }
            }
        }
        // Overwrite with a chunk (75%) or a constant (25%).
        13 => {
            if *m2_len >= 2 {
                let copy_len =
                    choose_block_len(fz.rand_mut(), *m2_len - 1, queue_cycle, over_10m);
                let Some(to) = pick_mutable_pos(fz.rand_mut(), ranges, *m2_len, copy_len) else {
                    return Ok(());
                };
                if fz.rand_mut().below(4) != 0 {
                    let from = fz.rand_mut().below((*m2_len - copy_len + 1) as u64) as usize;
                    if from != to {
                        let chunk: Vec<u8> =
                            buf[m2_start + from..m2_start + from + copy_len].to_vec();
                        buf[m2_start + to..m2_start + to + copy_len].copy_from_slice(&chunk);
                    }
                } else {
                    let fill = if fz.rand_mut().below(2) == 0 {
                        fz.rand_mut().below(256) as u8
                    } else {
                        let p = fz.rand_mut().below(*m2_len as u64) as usize;
                        buf[m2_start + p]
                    };
                    for b in &mut buf[m2_start + to..m2_start + to + copy_len] {
                        *b = fill;
                    }
                }
            }
        }
        // Dictionary overwrite, user or auto.
        14 => {
            let dict = fz.dictionary();
            let (user_cnt, auto_cnt) = (dict.extras.len(), dict.auto_extras.len());
            if user_cnt + auto_cnt == 0 {
                return Ok(());
            }
            let use_auto = auto_cnt > 0 && (user_cnt == 0 || fz.rand_mut().below(2) == 0);
            let token = if use_auto {
                let i = fz.rand_mut().below(auto_cnt as u64) as usize;
                fz.dictionary().auto_extras[i].data.clone()
            } else {
                let i = fz.rand_mut().below(user_cnt as u64) as usize;
                fz.dictionary().extras[i].data.clone()
            };
            if let Some(pos) = pick_mutable_pos(fz.rand_mut(), ranges, *m2_len, token.len()) {
                buf[m2_start + pos..m2_start + pos + token.len()].copy_from_slice(&token);
            }
        }
        // Dictionary insert.
        15 => {
            let dict = fz.dictionary();
            let (user_cnt, auto_cnt) = (dict.extras.len(), dict.auto_extras.len());
            if user_cnt + auto_cnt == 0 || buf.len() >= MAX_FILE {
                return Ok(());
            }
            let use_auto = auto_cnt > 0 && (user_cnt == 0 || fz.rand_mut().below(2) == 0);
            let token = if use_auto {
                let i = fz.rand_mut().below(auto_cnt as u64) as usize;
                fz.dictionary().auto_extras[i].data.clone()
            } else {
                let i = fz.rand_mut().below(user_cnt as u64) as usize;
                fz.dictionary().extras[i].data.clone()
            };
            let pos = fz.rand_mut().below(*m2_len as u64) as usize;
            insert_bytes(buf, bounds, m2_start + pos, &token);
            ranges_insert(ranges, pos, token.len());
            *m2_len += token.len();
        }
        // Replace one M2 message with a region from another seed.
        16 => {
            let spans = m2_message_spans(bounds, m2_start, *m2_len);
            if let Some(donor) = fz.donor_region().filter(|d| !d.is_empty()) {
                if spans.is_empty() {
                    return Ok(());
                }
                let (a, b) = spans[fz.rand_mut().below(spans.len() as u64) as usize];
                if buf.len() - (b - a) + donor.len() <= MAX_FILE {
                    replace_span(buf, bounds, a, b, &donor);
                    let delta = donor.len() as isize - (b - a) as isize;
                    if delta >= 0 {
                        ranges_insert(ranges, a.saturating_sub(m2_start), delta as usize);
                    } else {
                        ranges_delete(ranges, a.saturating_sub(m2_start), (-delta) as usize);
                    }
                    *m2_len = (*m2_len as isize + delta) as usize;
                }
            }
        }
        // Prepend or append a region from another seed as a new message.
        17 => {
            if let Some(donor) = fz.donor_region() {
                if !donor.is_empty() && buf.len() + donor.len() <= MAX_FILE {
                    let at = if fz.rand_mut().below(2) == 0 {
                        m2_start
                    } else {
                        m2_start + *m2_len
                    };
                    insert_message(buf, bounds, at, &donor);
                    ranges_insert(ranges, at - m2_start, donor.len());
                    *m2_len += donor.len();
                }
            }
        }
        // Duplicate one M2 message in place.
        18 => {
            let spans = m2_message_spans(bounds, m2_start, *m2_len);
            if spans.is_empty() {
                return Ok(());
            }
            let (a, b) = spans[fz.rand_mut().below(spans.len() as u64) as usize];
            if b > a && buf.len() + (b - a) <= MAX_FILE {
                let copy: Vec<u8> = buf[a..b].to_vec();
                insert_message(buf, bounds, b, &copy);
                ranges_insert(ranges, b - m2_start, copy.len());
                *m2_len += copy.len();
            }
        }
        _ => unreachable!(),
    }
    Ok(())
}

/// Replace the M2 blob with `prefix-of-ours ‖ suffix-of-donor`, split at a
/// random offset between the first and last differing bytes. Message
/// boundaries inside M2 are re-derived from the protocol plug-in. Returns
/// false when no usable donor exists.
pub fn splice_m2<R: TrialRunner>(fz: &mut R, ctx: &mut StageCtx) -> Result<bool, Error> {
    let m2: Vec<u8> = ctx.m2().to_vec();
    let Some(donor) = fz.splice_donor(&m2) else {
        return Ok(false);
    };
    if donor.len() < 2 {
        return Ok(false);
    }
    let Some((first, last)) = locate_diffs(&m2, &donor) else {
        return Ok(false);
    };
    if last < first + 2 {
        return Ok(false);
    }
    let split = first + 1 + fz.rand_mut().below((last - first - 1) as u64) as usize;

    let mut new_m2 = m2[..split.min(m2.len())].to_vec();
    new_m2.extend_from_slice(&donor[split.min(donor.len())..]);
    if new_m2.is_empty() {
        return Ok(false);
    }

    let rel_bounds = fz.split_messages(&new_m2);
    let m2_end = ctx.m2_start + ctx.m2_len;
    let suffix: Vec<u8> = ctx.out[m2_end..].to_vec();
    let suffix_bounds: Vec<usize> = ctx
        .bounds
        .iter()
        .filter(|&&b| b > m2_end)
        .map(|&b| b - m2_end)
        .collect();

    let mut out = ctx.out[..ctx.m2_start].to_vec();
    let mut bounds: Vec<usize> = ctx
        .bounds
        .iter()
        .copied()
        .filter(|&b| b <= ctx.m2_start)
        .collect();
    out.extend_from_slice(&new_m2);
    bounds.extend(rel_bounds.iter().map(|&b| ctx.m2_start + b));
    let new_m2_end = out.len();
    out.extend_from_slice(&suffix);
    bounds.extend(suffix_bounds.iter().map(|&b| new_m2_end + b));

    ctx.m2_len = new_m2.len();
    ctx.out = out;
    ctx.bounds = bounds;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bolts::hash64;

    /// Trial runner whose "trace" is an arbitrary function of the buffer.
    struct MockRunner {
        rand: StdRand,
        dict: Dictionary,
        trace: fn(&[u8]) -> u64,
        trials: Vec<(&'static str, Vec<u8>, Vec<usize>)>,
        donors: Vec<Vec<u8>>,
        region_ops: bool,
    }

    impl MockRunner {
        fn new(trace: fn(&[u8]) -> u64) -> Self {
            Self {
                rand: StdRand::with_seed(0x5eed),
                dict: Dictionary::new(),
                trace,
                trials: Vec::new(),
                donors: Vec::new(),
                region_ops: false,
            }
        }
    }

    impl TrialRunner for MockRunner {
        fn run_trial(
            &mut self,
            stage: &StageTag,
            buf: &[u8],
            bounds: &[usize],
        ) -> Result<TrialFeedback, Error> {
            self.trials.push((stage.name, buf.to_vec(), bounds.to_vec()));
            Ok(TrialFeedback {
                cksum: (self.trace)(buf),
                new_find: false,
                abort: false,
            })
        }

        fn rand_mut(&mut self) -> &mut StdRand {
            &mut self.rand
        }

        fn dictionary(&self) -> &Dictionary {
            &self.dict
        }

        fn add_auto_candidate(&mut self, candidate: &[u8]) {
            let mut rand = StdRand::with_seed(1);
            self.dict.maybe_add_auto(&mut rand, candidate);
        }

        fn donor_region(&mut self) -> Option<Vec<u8>> {
            self.donors.first().cloned()
        }

        fn splice_donor(&mut self, _cur: &[u8]) -> Option<Vec<u8>> {
            self.donors.first().cloned()
        }

        fn split_messages(&self, blob: &[u8]) -> Vec<usize> {
            if blob.is_empty() {
                Vec::new()
            } else {
                vec![blob.len()]
            }
        }

        fn region_mutation_enabled(&self) -> bool {
            self.region_ops
        }

        fn queue_cycle(&self) -> u64 {
            1
        }

        fn run_over_10m(&self) -> bool {
            false
        }
    }

    fn ignore_middle_byte(buf: &[u8]) -> u64 {
        hash64(&[buf[0], buf[2]])
    }

    #[test]
    fn effector_map_marks_inert_bytes() {
        // Buffer [0x00, 0xAA, 0x00]: flipping byte 1 never changes the
        // trace, so it must be skipped by the later byte stages.
        let out = vec![0x00, 0xAA, 0x00];
        let base = ignore_middle_byte(&out);
        let mut ctx = StageCtx::new(out, vec![3], 0, 3, base);
        let mut fz = MockRunner::new(ignore_middle_byte);

        let r = stage_byteflips(&mut fz, &mut ctx).unwrap();
        assert!(!r.aborted);
        assert_eq!(ctx.eff, vec![1, 0, 1]);

        fz.trials.clear();
        stage_arith(&mut fz, &mut ctx).unwrap();
        assert!(
            fz.trials
                .iter()
                .filter(|(n, _, _)| *n == "arith8")
                .all(|(_, buf, _)| buf[1] == 0xAA),
            "arith8 touched an ineffective byte"
        );
        // But effective bytes are exercised.
        assert!(fz
            .trials
            .iter()
            .any(|(n, buf, _)| *n == "arith8" && buf[0] != 0x00));
    }

    #[test]
    fn deterministic_stages_restore_the_buffer() {
        let out = b"M1|PAYLOAD|M3".to_vec();
        let bounds = vec![3, 10, 13];
        let base = hash64(&out);
        let mut ctx = StageCtx::new(out.clone(), bounds.clone(), 3, 7, base);
        let mut fz = MockRunner::new(hash64);
        fz.dict.extras.push(crate::dictionary::ExtraData {
            data: b"TOK".to_vec(),
            hit_count: 0,
        });

        let r = deterministic_stages(&mut fz, &mut ctx).unwrap();
        assert!(!r.aborted);
        assert_eq!(ctx.out, out, "stages must restore the working buffer");
        assert_eq!(ctx.bounds, bounds);

        // M1 and M3 bytes were never touched in any trial.
        for (_, buf, _) in &fz.trials {
            assert_eq!(&buf[..3], b"M1|");
            assert_eq!(&buf[buf.len() - 3..], b"|M3");
        }
    }

    #[test]
    fn havoc_preserves_m1_and_m3() {
        let out = b"AAAA-MUTATE-ZZZZ".to_vec();
        let bounds = vec![5, 12, 16];
        let base = hash64(&out);
        let mut ctx = StageCtx::new(out, bounds, 5, 7, base);
        let mut fz = MockRunner::new(hash64);
        fz.region_ops = true;
        fz.donors.push(b"DONOR".to_vec());
        fz.dict.extras.push(crate::dictionary::ExtraData {
            data: b"KEY".to_vec(),
            hit_count: 0,
        });

        let ranges = vec![Range {
            start: 0,
            len: 7,
            mutable: true,
        }];
        havoc_stage(&mut fz, &mut ctx, 100, 1, &ranges, false, false).unwrap();
        assert!(!fz.trials.is_empty());
        for (_, buf, bounds) in &fz.trials {
            assert_eq!(&buf[..5], b"AAAA-", "M1 must survive havoc");
            assert_eq!(&buf[buf.len() - 4..], b"ZZZZ", "M3 must survive havoc");
            // Bounds stay sorted and end at the buffer end.
            assert!(bounds.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(*bounds.last().unwrap(), buf.len());
        }
    }

    #[test]
    fn delete_shrinks_message_and_keeps_prefix() {
        // Entry with messages [(0,4), (4,10)]; M2 is message 1. Deleting
        // two bytes yields an 8-byte buffer with M1 untouched.
        let mut buf = b"HEADPAYLOA".to_vec();
        let mut bounds = vec![4, 10];
        delete_bytes(&mut buf, &mut bounds, 5, 2);
        assert_eq!(buf.len(), 8);
        assert_eq!(&buf[..4], b"HEAD");
        assert_eq!(bounds, vec![4, 8]);
    }

    #[test]
    fn insert_message_adds_a_boundary() {
        let mut buf = b"aabb".to_vec();
        let mut bounds = vec![2, 4];
        insert_message(&mut buf, &mut bounds, 2, b"XX");
        assert_eq!(buf, b"aaXXbb");
        assert_eq!(bounds, vec![2, 4, 6]);
    }

    #[test]
    fn reachability_predicates() {
        assert!(could_be_bitflip(0));
        assert!(could_be_bitflip(0b1));
        assert!(could_be_bitflip(0b1100));
        assert!(could_be_bitflip(0xff00));
        assert!(!could_be_bitflip(0b101));
        assert!(!could_be_bitflip(0xff0));

        assert!(could_be_arith(100, 101, 1));
        assert!(could_be_arith(100, 100 - ARITH_MAX, 1));
        assert!(!could_be_arith(100, 200, 1));
        assert!(could_be_arith(0x00ff, 0x0100, 2));

        assert!(could_be_interest(0, 0x7f, 1, false));
        assert!(could_be_interest(0, 0xffff8000, 4, true));
        assert!(!could_be_interest(0, 0x1234_5678, 4, true));
    }

    #[test]
    fn block_len_is_bounded() {
        let mut rand = StdRand::with_seed(99);
        for _ in 0..1000 {
            let l = choose_block_len(&mut rand, 40, 5, true);
            assert!((1..=40).contains(&l));
        }
        assert_eq!(choose_block_len(&mut rand, 0, 1, false), 0);
    }

    #[test]
    fn splice_mixes_current_and_donor() {
        let out = b"PREFIXABCDEFSUFFIX".to_vec();
        let bounds = vec![6, 12, 18];
        let mut ctx = StageCtx::new(out, bounds, 6, 6, 0);
        let mut fz = MockRunner::new(hash64);
        fz.donors.push(b"XYZDEF".to_vec());

        assert!(splice_m2(&mut fz, &mut ctx).unwrap());
        assert_eq!(&ctx.out[..6], b"PREFIX");
        assert_eq!(&ctx.out[ctx.out.len() - 6..], b"SUFFIX");
        assert_eq!(*ctx.bounds.last().unwrap(), ctx.out.len());
        // The blob now mixes both parents.
        let m2 = &ctx.out[6..6 + ctx.m2_len];
        assert_ne!(m2, b"ABCDEF");
    }

    #[test]
    fn splice_refuses_identical_donor() {
        let out = b"AABBBBCC".to_vec();
        let mut ctx = StageCtx::new(out, vec![2, 6, 8], 2, 4, 0);
        let mut fz = MockRunner::new(hash64);
        fz.donors.push(b"BBBB".to_vec());
        assert!(!splice_m2(&mut fz, &mut ctx).unwrap());
    }

    #[test]
    fn bit_walk_harvests_stable_runs() {
        // Flipping the low bit of any byte drives the trace to the same
        // distinctive checksum, so the buffer forms one stable run that
        // must end up in the auto dictionary.
        fn lsb_count(buf: &[u8]) -> u64 {
            hash64(&[buf.iter().filter(|b| *b & 1 == 1).count() as u8])
        }
        let out = b"XBDFHJ".to_vec();
        let base = lsb_count(&out);
        let mut ctx = StageCtx::new(out, vec![6], 0, 6, base);
        let mut fz = MockRunner::new(lsb_count);
        stage_bitflips(&mut fz, &mut ctx).unwrap();
        assert!(
            fz.dict.auto_extras.iter().any(|e| e.data == b"XBDFHJ"),
            "expected the stable run to be harvested"
        );
    }
}
