//! The command line interface of the fuzzer

use std::{error::Error, path::PathBuf};

use clap::Parser;
use statefuzz::config::{
    Config, NetEndpoint, SelectionMode, DEFAULT_MEM_LIMIT_MB,
};

#[derive(Debug, Parser)]
#[command(about = "Stateful coverage-guided fuzzer for network servers, with an LLM oracle")]
pub struct Cli {
    #[arg(
        help = "The instrumented server binary we want to fuzz",
        name = "EXEC",
        required = true
    )]
    pub executable: String,

    #[arg(
        help = "Arguments passed to the target",
        name = "arguments",
        num_args(1..),
        allow_hyphen_values = true,
    )]
    pub arguments: Vec<String>,

    #[arg(
        help = "The directory to read initial message sequences from ('seeds')",
        short = 'i',
        long = "in-dir",
        required = true
    )]
    pub in_dir: PathBuf,

    #[arg(
        help = "The directory to store all outputs in",
        short = 'o',
        long = "out-dir",
        required = true
    )]
    pub out_dir: PathBuf,

    #[arg(
        help = "Server network info, as scheme://host/port (e.g. tcp://127.0.0.1/8554)",
        short = 'N',
        long = "netinfo",
        required = true,
        value_parser = str::parse::<NetEndpoint>
    )]
    pub netinfo: NetEndpoint,

    #[arg(
        help = "Protocol tag selecting the request/response parser (e.g. FTP, SMTP, RTSP)",
        short = 'P',
        long = "protocol",
        required = true
    )]
    pub protocol: String,

    #[arg(
        help = "Enable state-aware mode: target states steer seed and region selection",
        short = 'E',
        long = "state-aware",
        default_value = "false"
    )]
    pub state_aware: bool,

    #[arg(
        help = "Enable region-level mutation operators",
        short = 'R',
        long = "region-mutation",
        default_value = "false"
    )]
    pub region_mutation: bool,

    #[arg(
        help = "Algorithm used to select the next target state",
        short = 'q',
        long = "state-selection",
        value_enum,
        default_value = "favored"
    )]
    pub state_selection: SelectionMode,

    #[arg(
        help = "Algorithm used to select the next seed within a state",
        short = 's',
        long = "seed-selection",
        value_enum,
        default_value = "favored"
    )]
    pub seed_selection: SelectionMode,

    #[arg(
        help = "Timeout for each individual execution, in milliseconds",
        short = 't',
        long = "timeout"
    )]
    pub timeout: Option<u64>,

    #[arg(
        help = "Socket send/receive timeout, in milliseconds",
        long = "socket-timeout",
        default_value = "1"
    )]
    pub socket_timeout: u64,

    #[arg(
        help = "Poll interval while waiting for the server to go quiet, in milliseconds",
        long = "poll-wait",
        default_value = "1"
    )]
    pub poll_wait: u64,

    #[arg(
        help = "Wait after spawning the server before connecting, in milliseconds",
        long = "server-wait",
        default_value = "0"
    )]
    pub server_wait: u64,

    #[arg(
        help = "Memory limit for the target, in megabytes (0 = none)",
        short = 'm',
        long = "mem-limit",
        default_value_t = DEFAULT_MEM_LIMIT_MB
    )]
    pub mem_limit: u64,

    #[arg(
        help = "Directory of dictionary tokens, one file per token",
        short = 'x',
        long = "dict-dir"
    )]
    pub dict_dir: Option<PathBuf>,

    #[arg(
        help = "Shell command run before every execution to clean server state",
        short = 'c',
        long = "cleanup-script"
    )]
    pub cleanup_script: Option<String>,

    #[arg(
        help = "Network namespace to run the target in",
        long = "netns"
    )]
    pub netns: Option<String>,

    #[arg(
        help = "Send SIGTERM to the server once the whole sequence was delivered",
        short = 'K',
        long = "terminate-child",
        default_value = "false"
    )]
    pub terminate_child: bool,

    #[arg(
        help = "Bind the fuzzer side of the connection to this local port",
        short = 'l',
        long = "local-port"
    )]
    pub local_port: Option<u16>,

    #[arg(
        help = "Skip the deterministic stages entirely",
        short = 'D',
        long = "skip-deterministic",
        default_value = "false"
    )]
    pub skip_deterministic: bool,

    #[arg(
        help = "Drop executions where some message got no response, even on new coverage",
        short = 'F',
        long = "false-negative-reduction",
        default_value = "false"
    )]
    pub false_negative_reduction: bool,

    #[arg(
        help = "Tolerate crashing or hanging seeds in the initial corpus",
        long = "skip-crashes",
        default_value = "false"
    )]
    pub skip_crashes: bool,

    #[arg(
        help = "Resume a previous session found in the output directory",
        long = "resume",
        default_value = "false"
    )]
    pub resume: bool,

    #[arg(
        help = "Sharding id of this instance",
        short = 'M',
        long = "master-id",
        default_value = "0"
    )]
    pub master_id: u32,

    #[arg(
        help = "Total number of sharded instances",
        long = "master-max",
        default_value = "1"
    )]
    pub master_max: u32,

    #[arg(
        help = "Environment variables passed to the target",
        short = 'e',
        long = "target-env",
        value_parser = parse_key_val_pairs::<String, String>,
    )]
    pub environment_variables: Option<std::vec::Vec<(String, String)>>,
}

impl Cli {
    pub fn into_config(self) -> Config {
        use std::time::Duration;
        Config {
            in_dir: self.in_dir,
            out_dir: self.out_dir,
            target: self.executable.into(),
            target_args: self.arguments.into_iter().map(Into::into).collect(),
            target_envs: self
                .environment_variables
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            endpoint: self.netinfo,
            protocol: self.protocol,
            state_aware: self.state_aware,
            region_mutation: self.region_mutation,
            state_selection: self.state_selection,
            seed_selection: self.seed_selection,
            exec_timeout: self.timeout.map(Duration::from_millis),
            socket_timeout: Duration::from_millis(self.socket_timeout),
            poll_wait: Duration::from_millis(self.poll_wait),
            server_wait: Duration::from_millis(self.server_wait),
            mem_limit_mb: self.mem_limit,
            dict_dir: self.dict_dir,
            cleanup_script: self.cleanup_script,
            netns: self.netns,
            terminate_child: self.terminate_child,
            local_port: self.local_port,
            skip_deterministic: self.skip_deterministic,
            false_negative_reduction: self.false_negative_reduction,
            skip_crashes: self.skip_crashes,
            resume: self.resume,
            master_id: self.master_id,
            master_max: self.master_max.max(1),
            hang_timeout: None,
            exit_when_done: false,
            bench_until_crash: false,
            debug_child: false,
            skip_bin_check: false,
            no_affinity: false,
            preload: None,
            defer_forksrv: false,
            persistent: false,
        }
    }
}

/// Parse a list of key-value pairs
fn parse_key_val_pairs<T, U>(
    strs: &str,
) -> Result<Vec<(T, U)>, Box<dyn Error + Send + Sync + 'static>>
where
    T: std::str::FromStr,
    T::Err: Error + Send + Sync + 'static,
    U: std::str::FromStr,
    U::Err: Error + Send + Sync + 'static,
{
    let mut v = Vec::new();
    for s in strs.split(',') {
        v.push(parse_key_val(s)?);
    }
    Ok(v)
}

/// Parse a single key-value pair
fn parse_key_val<T, U>(s: &str) -> Result<(T, U), Box<dyn Error + Send + Sync + 'static>>
where
    T: std::str::FromStr,
    T::Err: Error + Send + Sync + 'static,
    U: std::str::FromStr,
    U::Err: Error + Send + Sync + 'static,
{
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=value: no `=` found in `{s}`"))?;
    Ok((s[..pos].parse()?, s[pos + 1..].parse()?))
}
