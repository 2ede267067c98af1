//! Run configuration: everything the command line and the environment decide
//! once at startup, packaged as a plain value that is threaded through the
//! fuzzer context.

use std::{
    ffi::OsString,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use libafl_bolts::Error;

/// How the next target state, or the next seed within a state, is picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SelectionMode {
    Random,
    RoundRobin,
    #[default]
    Favored,
}

/// Transport used to reach the server under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

/// Parsed form of the `scheme://host/port` network info argument.
#[derive(Debug, Clone)]
pub struct NetEndpoint {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
}

impl FromStr for NetEndpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| format!("invalid network info `{s}`: expected scheme://host/port"))?;
        let transport = match scheme {
            "tcp" => Transport::Tcp,
            "udp" => Transport::Udp,
            other => return Err(format!("unsupported scheme `{other}`")),
        };
        let (host, port) = rest
            .rsplit_once('/')
            .ok_or_else(|| format!("invalid network info `{s}`: missing /port"))?;
        let port = port.parse::<u16>().map_err(|e| format!("invalid port: {e}"))?;
        if host.is_empty() {
            return Err(format!("invalid network info `{s}`: empty host"));
        }
        Ok(Self {
            transport,
            host: host.to_string(),
            port,
        })
    }
}

/// All the knobs. Defaults mirror the command-line defaults; the `env_*`
/// fields are filled in by [`Config::apply_env`].
#[derive(Debug, Clone)]
pub struct Config {
    pub in_dir: PathBuf,
    pub out_dir: PathBuf,
    pub target: OsString,
    pub target_args: Vec<OsString>,
    pub target_envs: Vec<(OsString, OsString)>,
    pub endpoint: NetEndpoint,
    pub protocol: String,

    pub state_aware: bool,
    pub region_mutation: bool,
    pub state_selection: SelectionMode,
    pub seed_selection: SelectionMode,

    /// Per-execution timeout. `None` means "pick the default".
    pub exec_timeout: Option<Duration>,
    pub socket_timeout: Duration,
    pub poll_wait: Duration,
    pub server_wait: Duration,
    pub mem_limit_mb: u64,

    pub dict_dir: Option<PathBuf>,
    pub cleanup_script: Option<String>,
    pub netns: Option<String>,
    pub terminate_child: bool,
    pub local_port: Option<u16>,
    pub skip_deterministic: bool,
    pub false_negative_reduction: bool,
    /// Tolerate crashing or hanging entries in the initial corpus instead
    /// of bailing out.
    pub skip_crashes: bool,
    pub resume: bool,

    /// Sharding: this instance's id and the total number of masters. A
    /// deterministic stage is only run when `entry_id % master_max ==
    /// master_id`.
    pub master_id: u32,
    pub master_max: u32,

    // Environment-driven toggles.
    pub hang_timeout: Option<Duration>,
    pub exit_when_done: bool,
    pub bench_until_crash: bool,
    pub debug_child: bool,
    pub skip_bin_check: bool,
    pub no_affinity: bool,
    pub preload: Option<String>,
    pub defer_forksrv: bool,
    pub persistent: bool,
}

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_millis(1);
pub const DEFAULT_POLL_WAIT: Duration = Duration::from_millis(1);
pub const DEFAULT_MEM_LIMIT_MB: u64 = 50;

impl Config {
    /// Fold the recognized environment variables into the config. CLI flags
    /// win where both are given, matching the usual AFL-family behaviour.
    pub fn apply_env(&mut self) -> Result<(), Error> {
        let set = |name: &str| std::env::var_os(name).is_some();

        if let Ok(ms) = std::env::var("AFL_HANG_TMOUT") {
            let ms: u64 = ms
                .parse()
                .map_err(|e| Error::illegal_argument(format!("Bad AFL_HANG_TMOUT: {e}")))?;
            self.hang_timeout = Some(Duration::from_millis(ms));
        }
        if set("AFL_EXIT_WHEN_DONE") {
            self.exit_when_done = true;
        }
        if set("AFL_BENCH_UNTIL_CRASH") {
            self.bench_until_crash = true;
        }
        if set("AFL_DEBUG_CHILD") || set("AFL_DEBUG_CHILD_OUTPUT") {
            self.debug_child = true;
        }
        if set("AFL_SKIP_BIN_CHECK") {
            self.skip_bin_check = true;
        }
        if set("AFL_SKIP_CRASHES") {
            self.skip_crashes = true;
        }
        if set("AFL_NO_AFFINITY") {
            self.no_affinity = true;
        }
        if let Ok(p) = std::env::var("AFL_PRELOAD") {
            self.preload = Some(p);
        }
        if set("AFL_DEFER_FORKSRV") {
            self.defer_forksrv = true;
        }
        if set("AFL_PERSISTENT") {
            self.persistent = true;
        }
        Ok(())
    }

    pub fn exec_timeout(&self) -> Duration {
        self.exec_timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT)
    }

    /// Timeout used when re-checking a candidate hang: noticeably more
    /// generous than the exec timeout, unless the user pinned one.
    pub fn hang_timeout(&self) -> Duration {
        self.hang_timeout
            .unwrap_or_else(|| self.exec_timeout().saturating_mul(2).max(Duration::from_secs(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_endpoint() {
        let ep: NetEndpoint = "tcp://127.0.0.1/8554".parse().unwrap();
        assert_eq!(ep.transport, Transport::Tcp);
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.port, 8554);

        let ep: NetEndpoint = "udp://localhost/69".parse().unwrap();
        assert_eq!(ep.transport, Transport::Udp);

        assert!("http://x/1".parse::<NetEndpoint>().is_err());
        assert!("tcp://nohost".parse::<NetEndpoint>().is_err());
        assert!("tcp:///21".parse::<NetEndpoint>().is_err());
    }
}
