//! Calibration: run a queue entry a few times to pin down its trace
//! checksum, execution time and bitmap size, and to spot variable
//! behaviour. The dry run calibrates the whole initial corpus before the
//! main loop starts.

use std::time::Instant;

use libafl_bolts::Error;

use crate::{
    coverage::{count_bytes, has_new_bits, hash_trace},
    forkserver::{ExecDriver, Fault},
    fuzzer::{annotate_regions, Fuzzer},
    queue::QueueId,
};

/// Calibration runs for a well-behaved entry.
pub const CAL_CYCLES: u32 = 3;
/// Upper bound once variable behaviour shows up.
pub const CAL_CYCLES_LONG: u32 = 8;
/// Give up on an entry after this many failed calibration attempts.
pub const CAL_CHANCES: u8 = 3;

/// Calibrate one entry. Returns the fault that cut calibration short, or
/// `Fault::NoBits` when the entry exercises nothing the map has not seen.
pub fn calibrate_case(
    fz: &mut Fuzzer,
    id: QueueId,
    during_dry_run: bool,
) -> Result<Fault, Error> {
    let (data, bounds, entry_name) = {
        let entry = fz.queue.get(id);
        let data = entry.load_input()?;
        let bounds: Vec<usize> = if entry.regions.is_empty() {
            vec![data.len()]
        } else {
            entry
                .regions
                .iter()
                .map(|r| r.end.min(data.len()))
                .collect()
        };
        let name = entry
            .fname
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        (data, bounds, name)
    };

    let mut cycles = if fz.cfg.resume || fz.queue.get(id).var_behavior {
        CAL_CYCLES_LONG
    } else {
        CAL_CYCLES
    };

    let mut first_cksum = 0u64;
    let mut first_trace: Vec<u8> = Vec::new();
    let mut responses_of_first_run = None;
    let mut variable = false;
    let mut new_bits = 0u8;
    let mut total_us = 0u64;
    let mut runs = 0u64;
    let mut fault = Fault::None;

    let mut i = 0u32;
    while i < cycles {
        if fz.stop_requested() {
            break;
        }
        let started = Instant::now();
        let (run_fault, outcome) = fz.run_target_sequence(&data, &bounds)?;
        total_us += started.elapsed().as_micros() as u64;
        runs += 1;

        if run_fault != Fault::None {
            fault = run_fault;
            fz.queue.get_mut(id).cal_failed += 1;
            break;
        }

        fz.update_state_tracking(&outcome.responses);
        let cksum = hash_trace(fz.trace.as_slice());

        if i == 0 {
            if during_dry_run
                && matches!(fz.exec, ExecDriver::Forkserver(_))
                && count_bytes(fz.trace.as_slice()) == 0
            {
                fault = Fault::NoInstrumentation;
                break;
            }
            first_cksum = cksum;
            first_trace = fz.trace.as_slice().to_vec();
            responses_of_first_run = Some(outcome.responses.clone());
            new_bits = has_new_bits(&mut fz.cov.virgin_bits, &first_trace);
        } else if cksum != first_cksum {
            // The same input walked a different trace: remember which
            // bytes wobble and calibrate longer.
            variable = true;
            cycles = CAL_CYCLES_LONG;
            for (vb, (a, b)) in fz
                .var_bytes
                .iter_mut()
                .zip(first_trace.iter().zip(fz.trace.as_slice()))
            {
                if a != b {
                    *vb = 1;
                }
            }
        }
        i += 1;
    }

    let avg_us = total_us / runs.max(1);
    fz.stats.total_cal_us += total_us;
    fz.stats.total_cal_cycles += runs;

    {
        let entry = fz.queue.get_mut(id);
        entry.exec_us = avg_us;
        entry.exec_cksum = first_cksum;
        entry.bitmap_size = count_bytes(&first_trace);
        if new_bits == 2 {
            entry.has_new_cov = true;
        }
        if variable && !entry.var_behavior {
            entry.var_behavior = true;
            log::warn!("Entry {entry_name} shows variable behaviour");
        }
    }
    if variable {
        if let Err(e) = fz.out.mark_state("variable_behavior", &entry_name) {
            log::warn!("Cannot mark variable_behavior: {e}");
        }
    }
    fz.stats.total_bitmap_size += u64::from(fz.queue.get(id).bitmap_size);
    fz.stats.total_bitmap_entries += 1;

    if fault == Fault::None {
        // First-run responses define the region state annotations.
        if let Some(responses) = &responses_of_first_run {
            let mut regions = std::mem::take(&mut fz.queue.get_mut(id).regions);
            annotate_regions(&mut regions, responses, fz.protocol.as_ref());
            let entry = fz.queue.get_mut(id);
            entry.regions = regions;
            entry.refresh_state_set();
        }
        let states = fz.queue.get(id).state_set.clone();
        fz.ipsm.register_seed(id, &states, during_dry_run);
        if !first_trace.is_empty() {
            fz.queue.update_bitmap_score(id, &first_trace);
        }
        if let Err(e) = fz.out.save_regions(&entry_name, &fz.queue.get(id).regions) {
            log::warn!("Cannot persist calibrated regions: {e}");
        }
        if new_bits == 0 && during_dry_run && !fz.queue.get(id).has_new_cov {
            return Ok(Fault::NoBits);
        }
    }
    Ok(fault)
}

/// Calibrate the whole initial corpus before fuzzing starts. Crashing or
/// hanging seeds are fatal unless crash skipping was requested.
pub fn perform_dry_run(fz: &mut Fuzzer) -> Result<(), Error> {
    log::info!("Starting dry run over {} seeds", fz.queue.len());
    fz.dry_run_active = true;
    let result = dry_run_inner(fz);
    fz.dry_run_active = false;
    result
}

fn dry_run_inner(fz: &mut Fuzzer) -> Result<(), Error> {
    for id in 0..fz.queue.len() {
        if fz.stop_requested() {
            break;
        }
        let name = fz
            .queue
            .get(id)
            .fname
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut fault = calibrate_case(fz, id, true)?;

        // One retry for flaky startup conditions.
        if matches!(fault, Fault::Timeout | Fault::Crash)
            && fz.queue.get(id).cal_failed < CAL_CHANCES
        {
            fault = calibrate_case(fz, id, true)?;
        }

        match fault {
            Fault::None => log::debug!("Seed {name} calibrated"),
            Fault::NoBits => {
                log::warn!("Seed {name} produced no new coverage; likely redundant")
            }
            Fault::NoInstrumentation => {
                return Err(Error::illegal_state(format!(
                    "Seed {name} produced an empty bitmap. The target does not appear \
                     to be instrumented."
                )));
            }
            Fault::Timeout => {
                if fz.cfg.skip_crashes {
                    log::warn!("Seed {name} times out, skipping");
                } else {
                    return Err(Error::illegal_state(format!(
                        "Seed {name} times out. Raise the exec timeout, or allow \
                         skipping misbehaving seeds."
                    )));
                }
            }
            Fault::Crash => {
                if fz.cfg.skip_crashes {
                    log::warn!("Seed {name} crashes the target, skipping");
                } else {
                    return Err(Error::illegal_state(format!(
                        "Seed {name} crashes the target. Fix the corpus, or allow \
                         skipping misbehaving seeds."
                    )));
                }
            }
            Fault::Error => {
                return Err(Error::illegal_state(
                    "The forkserver stub could not exec the target".to_string(),
                ));
            }
        }
    }
    log::info!(
        "Dry run done: {} states observed, {} edges in {} paths",
        fz.ipsm.n_nodes(),
        fz.ipsm.n_edges(),
        fz.queue.len()
    );
    Ok(())
}
