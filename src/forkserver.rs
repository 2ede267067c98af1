//! The child-process driver: an AFL-style forkserver talked to over a
//! control/status pipe pair, plus a direct-exec fallback for targets built
//! without instrumentation.
//!
//! The stub in the instrumented target initializes once, signals readiness
//! with a 4-byte hello, and then forks one child per execution on request.
//! Requests and replies are single 4-byte words.

use std::{
    io::{self, Read},
    os::{
        fd::{AsRawFd, BorrowedFd},
        unix::process::{CommandExt, ExitStatusExt},
    },
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};

use libafl_bolts::{
    os::{dup2, pipes::Pipe},
    Error,
};
use nix::{
    libc,
    sys::{
        select::{pselect, FdSet},
        signal::{kill, SigSet, Signal},
        time::TimeSpec,
        wait::waitpid,
    },
    unistd::Pid,
};

use crate::{bolts::create_timeout_error, config::Config};

/// Control pipe lands on this descriptor in the child; status pipe on the
/// next one. Fixed numbers known to the instrumentation runtime.
pub const FORKSRV_FD: i32 = 198;

/// The default signal to use to kill child processes
const KILL_SIGNAL_DEFAULT: Signal = Signal::SIGKILL;

/// Outcome classification for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    Timeout,
    Crash,
    /// The stub could not exec the target.
    Error,
    /// First run left the bitmap empty.
    NoInstrumentation,
    /// Calibration produced no new bits.
    NoBits,
}

/// Configure the target process before exec: session, rlimits, pipes.
pub trait ConfigTarget {
    /// Sets the sid
    fn setsid(&mut self) -> &mut Self;
    /// Sets a mem limit and disables core dumps
    fn setlimit(&mut self, memlimit: u64) -> &mut Self;
    /// Sets the forkserver pipes
    fn setpipe(
        &mut self,
        st_read: i32,
        st_write: i32,
        ctl_read: i32,
        ctl_write: i32,
    ) -> &mut Self;
}

impl ConfigTarget for Command {
    fn setsid(&mut self) -> &mut Self {
        let func = move || {
            unsafe {
                libc::setsid();
            };
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }

    fn setpipe(
        &mut self,
        st_read: i32,
        st_write: i32,
        ctl_read: i32,
        ctl_write: i32,
    ) -> &mut Self {
        let func = move || {
            if dup2(ctl_read, FORKSRV_FD).is_err() {
                return Err(io::Error::last_os_error());
            }
            if dup2(st_write, FORKSRV_FD + 1).is_err() {
                return Err(io::Error::last_os_error());
            }
            unsafe {
                libc::close(st_read);
                libc::close(st_write);
                libc::close(ctl_read);
                libc::close(ctl_write);
            }
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }

    #[allow(trivial_numeric_casts, clippy::cast_possible_wrap)]
    fn setlimit(&mut self, memlimit: u64) -> &mut Self {
        if memlimit == 0 {
            return self;
        }
        let func = move || {
            let memlimit: libc::rlim_t = (memlimit as libc::rlim_t) << 20;
            let r = libc::rlimit {
                rlim_cur: memlimit,
                rlim_max: memlimit,
            };
            let r0 = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            let mut ret = unsafe { libc::setrlimit(libc::RLIMIT_AS, &r) };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            ret = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &r0) };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }
}

/// Build the target command line, honoring the netns wrapper, preload and
/// mode signatures from the config.
fn build_command(cfg: &Config) -> Command {
    let mut command = match &cfg.netns {
        Some(ns) => {
            let mut c = Command::new("ip");
            c.arg("netns").arg("exec").arg(ns).arg(&cfg.target);
            c
        }
        None => Command::new(&cfg.target),
    };
    command.args(&cfg.target_args);
    let (stdout, stderr) = if cfg.debug_child {
        (Stdio::inherit(), Stdio::inherit())
    } else {
        (Stdio::null(), Stdio::null())
    };
    command.stdin(Stdio::null()).stdout(stdout).stderr(stderr);
    command.env("LD_BIND_NOW", "1");
    if let Some(preload) = &cfg.preload {
        command.env("LD_PRELOAD", preload);
    }
    if cfg.persistent {
        command.env("__AFL_PERSISTENT", "1");
    }
    if cfg.defer_forksrv {
        command.env("__AFL_DEFER_FORKSRV", "1");
    }
    for (k, v) in &cfg.target_envs {
        command.env(k, v);
    }
    command
}

/// The [`Forkserver`] is the communication channel with the stub process
/// that forks on request of the fuzzer. The communication happens via pipe.
#[derive(Debug)]
pub struct Forkserver {
    /// The "actual" forkserver we spawned in the target
    fsrv_handle: Child,
    /// Status pipe
    st_pipe: Pipe,
    /// Control pipe
    ctl_pipe: Pipe,
    /// Pid of the current forked child (child of the forkserver) during execution
    child_pid: Option<Pid>,
    /// The last wait status reported to us
    status: i32,
    /// If the last run timed out
    last_run_timed_out: bool,
    kill_signal: Signal,
}

impl Drop for Forkserver {
    fn drop(&mut self) {
        log::debug!("Dropping forkserver");
        if let Some(pid) = self.child_pid {
            if let Err(err) = kill(pid, self.kill_signal) {
                log::warn!("Failed to deliver kill signal to child process {pid}: {err}");
            }
        }
        let forkserver_pid = Pid::from_raw(self.fsrv_handle.id().try_into().unwrap());
        if let Err(err) = kill(forkserver_pid, self.kill_signal) {
            log::warn!("Failed to deliver kill signal to forkserver {forkserver_pid}: {err}");
            let _ = kill(forkserver_pid, Signal::SIGKILL);
        } else if let Err(err) = waitpid(forkserver_pid, None) {
            log::warn!("Waitpid on forkserver {forkserver_pid} failed: {err}");
            let _ = kill(forkserver_pid, Signal::SIGKILL);
        }
    }
}

impl Forkserver {
    /// Spawn the stub and wait for its 4-byte hello.
    pub fn start(cfg: &Config) -> Result<Self, Error> {
        let mut st_pipe = Pipe::new()?;
        let mut ctl_pipe = Pipe::new()?;

        let mut command = build_command(cfg);
        let fsrv_handle = match command
            .setlimit(cfg.mem_limit_mb)
            .setsid()
            .setpipe(
                st_pipe.read_end().unwrap(),
                st_pipe.write_end().unwrap(),
                ctl_pipe.read_end().unwrap(),
                ctl_pipe.write_end().unwrap(),
            )
            .spawn()
        {
            Ok(handle) => handle,
            Err(err) => {
                return Err(Error::illegal_state(format!(
                    "Could not spawn the forkserver: {err:#?}"
                )))
            }
        };

        // The stub keeps the other ends.
        ctl_pipe.close_read_end();
        st_pipe.close_write_end();

        let mut this = Self {
            fsrv_handle,
            st_pipe,
            ctl_pipe,
            child_pid: None,
            status: 0,
            last_run_timed_out: false,
            kill_signal: KILL_SIGNAL_DEFAULT,
        };

        match this.read_st_timed(&TimeSpec::from_duration(Duration::from_secs(10)))? {
            Some(_) => {
                log::info!("All right - fork server is up.");
                Ok(this)
            }
            None => Err(create_timeout_error(
                "Timeout while waiting for the forkserver hello",
            )),
        }
    }

    pub fn child_pid(&self) -> Option<Pid> {
        self.child_pid
    }

    pub fn last_run_timed_out(&self) -> bool {
        self.last_run_timed_out
    }

    /// Write a 4-byte word into the control pipe, guarded by a pselect
    /// deadline.
    fn write_ctl_timed(&mut self, val: i32, timeout: &TimeSpec) -> Result<Option<usize>, Error> {
        let Some(ctl_write) = self.ctl_pipe.write_end() else {
            return Err(create_timeout_error("Control pipe end was already closed"));
        };
        // # Safety
        // The FD is valid at this point in time.
        let ctl_write = unsafe { BorrowedFd::borrow_raw(ctl_write) };
        let mut writefds = FdSet::new();
        writefds.insert(&ctl_write);
        let sret = pselect(
            Some(writefds.highest().unwrap().as_raw_fd() + 1),
            None,
            &mut writefds,
            None,
            Some(timeout),
            Some(&SigSet::empty()),
        )
        .map_err(|e| Error::unknown(format!("pselect failed: {e}")))?;
        if sret > 0 {
            use std::io::Write;
            let slen = self.ctl_pipe.write(&val.to_ne_bytes())?;
            Ok(Some(slen))
        } else {
            Ok(None)
        }
    }

    /// Read a 4-byte word from the status pipe; `Ok(None)` on deadline.
    fn read_st_timed(&mut self, timeout: &TimeSpec) -> Result<Option<i32>, Error> {
        let mut buf = [0u8; 4];
        let Some(st_read) = self.st_pipe.read_end() else {
            return Err(create_timeout_error("Status pipe end was already closed"));
        };
        // # Safety
        // The FD is valid at this point in time.
        let st_read = unsafe { BorrowedFd::borrow_raw(st_read) };
        let mut readfds = FdSet::new();
        readfds.insert(&st_read);
        // Pass a copy; select updates the timeout to the time left.
        let sret = pselect(
            Some(readfds.highest().unwrap().as_raw_fd() + 1),
            &mut readfds,
            None,
            None,
            Some(timeout),
            Some(&SigSet::empty()),
        )
        .map_err(|e| Error::unknown(format!("pselect failed: {e}")))?;
        if sret > 0 {
            if self.st_pipe.read_exact(&mut buf).is_ok() {
                Ok(Some(i32::from_ne_bytes(buf)))
            } else {
                Err(Error::unknown(
                    "Unable to communicate with (read from) fork server (OOM?)".to_string(),
                ))
            }
        } else {
            Ok(None)
        }
    }

    /// Ask the stub to fork a fresh child; returns its pid. The word we
    /// send tells the stub whether the previous run timed out.
    pub fn request_child(&mut self) -> Result<Pid, Error> {
        let two_secs = TimeSpec::from_duration(Duration::from_secs(2));
        let send_len = self
            .write_ctl_timed(i32::from(self.last_run_timed_out), &two_secs)?
            .ok_or_else(|| create_timeout_error("Could not write to forkserver"))?;
        self.last_run_timed_out = false;
        if send_len != 4 {
            return Err(Error::unknown(
                "Unable to request new process from fork server (OOM?)".to_string(),
            ));
        }
        let pid = self
            .read_st_timed(&two_secs)?
            .ok_or_else(|| create_timeout_error("Could not read PID from forkserver"))?;
        if pid <= 0 {
            return Err(Error::unknown(
                "Fork server is misbehaving (OOM?)".to_string(),
            ));
        }
        self.child_pid = Some(Pid::from_raw(pid));
        Ok(Pid::from_raw(pid))
    }

    /// Wait for the child's wait-status, killing it when the deadline
    /// passes.
    pub fn await_status(&mut self, timeout: Duration) -> Result<Fault, Error> {
        let mut timed_out = false;
        let status = match self.read_st_timed(&TimeSpec::from_duration(timeout))? {
            Some(status) => status,
            None => {
                // We must kill a hung child, or the next pid read would
                // desynchronize the protocol.
                timed_out = true;
                self.last_run_timed_out = true;
                if let Some(pid) = self.child_pid {
                    if let Err(e) = kill(pid, self.kill_signal) {
                        log::warn!("Error killing timed-out child: {e}");
                    }
                }
                self.read_st_timed(&TimeSpec::from_duration(Duration::from_secs(2)))?
                    .ok_or_else(|| {
                        create_timeout_error("Could not read from forkserver after timeout")
                    })?
            }
        };
        self.status = status;
        if !libc::WIFSTOPPED(status) {
            self.child_pid = None;
        }
        if timed_out {
            Ok(Fault::Timeout)
        } else if libc::WIFSIGNALED(status) {
            Ok(Fault::Crash)
        } else {
            Ok(Fault::None)
        }
    }

    /// Graceful pre-wait termination, used by the network driver once the
    /// whole sequence has been delivered.
    pub fn terminate_child(&mut self, signal: Signal) {
        if let Some(pid) = self.child_pid {
            if let Err(e) = kill(pid, signal) {
                log::debug!("Could not deliver {signal} to child {pid}: {e}");
            }
        }
    }

    /// Signal that terminated the last child, 0 for a clean exit.
    pub fn last_signal(&self) -> i32 {
        if libc::WIFSIGNALED(self.status) {
            libc::WTERMSIG(self.status)
        } else {
            0
        }
    }
}

/// Fallback driver for uninstrumented targets: plain spawn-and-wait, one
/// process per execution.
#[derive(Debug)]
pub struct DirectExecutor {
    child: Option<Child>,
    kill_signal: Signal,
    last_signal: i32,
}

impl DirectExecutor {
    pub fn new() -> Self {
        Self {
            child: None,
            kill_signal: KILL_SIGNAL_DEFAULT,
            last_signal: 0,
        }
    }

    pub fn spawn_child(&mut self, cfg: &Config) -> Result<Pid, Error> {
        self.reap();
        let mut command = build_command(cfg);
        let child = command
            .setlimit(cfg.mem_limit_mb)
            .setsid()
            .spawn()
            .map_err(|err| {
                Error::illegal_state(format!("Could not spawn the target: {err:#?}"))
            })?;
        let pid = Pid::from_raw(child.id().try_into().unwrap());
        self.child = Some(child);
        Ok(pid)
    }

    pub fn child_pid(&self) -> Option<Pid> {
        self.child
            .as_ref()
            .map(|c| Pid::from_raw(c.id().try_into().unwrap()))
    }

    pub fn terminate_child(&mut self, signal: Signal) {
        if let Some(pid) = self.child_pid() {
            let _ = kill(pid, signal);
        }
    }

    pub fn await_status(&mut self, timeout: Duration) -> Result<Fault, Error> {
        let Some(child) = self.child.as_mut() else {
            return Err(Error::illegal_state("No child to wait for"));
        };
        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    self.child = None;
                    self.last_signal = status.signal().unwrap_or(0);
                    return Ok(if status.signal().is_some() {
                        Fault::Crash
                    } else {
                        Fault::None
                    });
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = kill(
                            Pid::from_raw(child.id().try_into().unwrap()),
                            self.kill_signal,
                        );
                        let _ = child.wait();
                        self.child = None;
                        return Ok(Fault::Timeout);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => {
                    self.child = None;
                    return Err(Error::unknown(format!("Waiting for the child failed: {e}")));
                }
            }
        }
    }

    fn reap(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = kill(
                Pid::from_raw(child.id().try_into().unwrap()),
                self.kill_signal,
            );
            let _ = child.wait();
        }
    }
}

impl Drop for DirectExecutor {
    fn drop(&mut self) {
        self.reap();
    }
}

impl Default for DirectExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Whichever driver the target supports. The forkserver is tried first;
/// targets without instrumentation fall back to direct exec per run.
#[derive(Debug)]
pub enum ExecDriver {
    Forkserver(Forkserver),
    Direct(DirectExecutor),
}

impl ExecDriver {
    pub fn start(cfg: &Config) -> Result<Self, Error> {
        if cfg.skip_bin_check {
            log::info!("Binary check disabled, using direct execution");
            return Ok(Self::Direct(DirectExecutor::new()));
        }
        match Forkserver::start(cfg) {
            Ok(fsrv) => Ok(Self::Forkserver(fsrv)),
            Err(e) => {
                log::warn!("No forkserver handshake ({e}); falling back to direct execution");
                Ok(Self::Direct(DirectExecutor::new()))
            }
        }
    }

    /// Start one execution of the target; returns the child pid.
    pub fn begin_run(&mut self, cfg: &Config) -> Result<Pid, Error> {
        match self {
            Self::Forkserver(f) => f.request_child(),
            Self::Direct(d) => d.spawn_child(cfg),
        }
    }

    pub fn await_status(&mut self, timeout: Duration) -> Result<Fault, Error> {
        match self {
            Self::Forkserver(f) => f.await_status(timeout),
            Self::Direct(d) => d.await_status(timeout),
        }
    }

    pub fn terminate_child(&mut self, signal: Signal) {
        match self {
            Self::Forkserver(f) => f.terminate_child(signal),
            Self::Direct(d) => d.terminate_child(signal),
        }
    }

    pub fn child_pid(&self) -> Option<Pid> {
        match self {
            Self::Forkserver(f) => f.child_pid(),
            Self::Direct(d) => d.child_pid(),
        }
    }

    /// Signal that terminated the last child, 0 if none.
    pub fn last_signal(&self) -> i32 {
        match self {
            Self::Forkserver(f) => f.last_signal(),
            Self::Direct(d) => d.last_signal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetEndpoint, SelectionMode};
    use std::{ffi::OsString, path::PathBuf};

    fn test_config(target: &str, args: &[&str]) -> Config {
        Config {
            in_dir: PathBuf::new(),
            out_dir: PathBuf::new(),
            target: OsString::from(target),
            target_args: args.iter().map(OsString::from).collect(),
            target_envs: Vec::new(),
            endpoint: "tcp://127.0.0.1/1".parse::<NetEndpoint>().unwrap(),
            protocol: "RAW".into(),
            state_aware: false,
            region_mutation: false,
            state_selection: SelectionMode::Random,
            seed_selection: SelectionMode::Random,
            exec_timeout: None,
            socket_timeout: Duration::from_millis(1),
            poll_wait: Duration::from_millis(1),
            server_wait: Duration::ZERO,
            mem_limit_mb: 0,
            dict_dir: None,
            cleanup_script: None,
            netns: None,
            terminate_child: false,
            local_port: None,
            skip_deterministic: false,
            false_negative_reduction: false,
            skip_crashes: false,
            resume: false,
            master_id: 0,
            master_max: 1,
            hang_timeout: None,
            exit_when_done: false,
            bench_until_crash: false,
            debug_child: false,
            skip_bin_check: true,
            no_affinity: true,
            preload: None,
            defer_forksrv: false,
            persistent: false,
        }
    }

    #[test]
    fn direct_executor_times_out_and_recovers() {
        // Target sleeps far past the timeout: the driver must fire the
        // deadline, kill the child, and report a timeout. A fresh run
        // right after must work.
        let cfg = test_config("/bin/sleep", &["10"]);
        let mut exec = DirectExecutor::new();
        exec.spawn_child(&cfg).unwrap();
        assert_eq!(
            exec.await_status(Duration::from_millis(50)).unwrap(),
            Fault::Timeout
        );
        assert!(exec.child_pid().is_none());

        exec.spawn_child(&cfg).unwrap();
        assert_eq!(
            exec.await_status(Duration::from_millis(50)).unwrap(),
            Fault::Timeout
        );
    }

    #[test]
    fn direct_executor_reports_clean_exit() {
        let cfg = test_config("/bin/true", &[]);
        let mut exec = DirectExecutor::new();
        exec.spawn_child(&cfg).unwrap();
        assert_eq!(
            exec.await_status(Duration::from_secs(5)).unwrap(),
            Fault::None
        );
    }

    #[test]
    fn direct_executor_reports_crash() {
        let cfg = test_config("/bin/sh", &["-c", "kill -SEGV $$"]);
        let mut exec = DirectExecutor::new();
        exec.spawn_child(&cfg).unwrap();
        assert_eq!(
            exec.await_status(Duration::from_secs(5)).unwrap(),
            Fault::Crash
        );
    }
}
