mod cli;

use clap::Parser;
use libafl_bolts::Error;
use statefuzz::fuzzer::Fuzzer;

fn main() -> Result<(), Error> {
    env_logger::init();

    let cli = cli::Cli::parse();
    let mut cfg = cli.into_config();
    cfg.apply_env()?;

    if !cfg.no_affinity {
        bind_cpu();
    }

    let mut fuzzer = Fuzzer::new(cfg)?;
    fuzzer.fuzz_loop()
}

/// Pin the fuzzer to one CPU; the instrumented children inherit the mask.
/// Spread instances over cores by pid so parallel runs do not pile up.
fn bind_cpu() {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let core = std::process::id() as usize % cores;
    let mut set = CpuSet::new();
    if set.set(core).is_ok() {
        if let Err(e) = sched_setaffinity(Pid::from_raw(0), &set) {
            log::warn!("Could not bind to core {core}: {e}");
        } else {
            log::info!("Bound to core {core}");
        }
    }
}
