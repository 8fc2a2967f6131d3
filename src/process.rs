use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::SessionError;
use crate::health;
use crate::signal::ShutdownSignal;
use crate::tunnel::{Bind, ForwardSession, Transport, TunnelParams};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const STDERR_TAIL_LINES: usize = 20;

/// Opens forwarding sessions by running the system ssh client, one process per tunnel.
pub struct SshTransport {
    settings: Settings,
}

impl SshTransport {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Arguments for `ssh`: no remote command, one -L per forward pair.
    fn ssh_args(&self, params: &TunnelParams) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-N".into(),
            "-T".into(),
            "-o".into(),
            "ExitOnForwardFailure=yes".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.settings.connect_timeout().as_secs()),
        ];
        for opt in &self.settings.ssh_options {
            args.push("-o".into());
            args.push(opt.clone());
        }
        if let Some(key) = params.ssh_private_key_path() {
            args.push("-i".into());
            args.push(key.display().to_string());
            args.push("-o".into());
            args.push("IdentitiesOnly=yes".into());
        }
        if let Some(user) = params.ssh_username() {
            args.push("-l".into());
            args.push(user.to_string());
        }
        for (local, remote) in params.pairs() {
            args.push("-L".into());
            args.push(format!(
                "{}:{}:{}:{}",
                bracket_v6(&local.host),
                local.port,
                bracket_v6(&remote.host),
                remote.port
            ));
        }
        args.push(params.ssh_host().to_string());
        args
    }
}

/// ssh wants IPv6 literals in -L specs wrapped in brackets.
fn bracket_v6(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

impl Transport for SshTransport {
    fn open(&self, params: &TunnelParams) -> Result<Box<dyn ForwardSession>, SessionError> {
        // Check for port conflicts before spawning
        for bind in params.local_binds() {
            if let Err(e) = health::try_bind(bind) {
                return Err(match e.kind() {
                    ErrorKind::AddrInUse => SessionError::AddressInUse(bind.to_string()),
                    _ => SessionError::LocalBind {
                        bind: bind.to_string(),
                        source: e,
                    },
                });
            }
        }

        let args = self.ssh_args(params);
        debug!("running {} {}", self.settings.ssh_program, args.join(" "));

        let mut child = Command::new(&self.settings.ssh_program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // keep terminal ^C away from ssh so shutdown stays orderly
            .process_group(0)
            .spawn()
            .map_err(SessionError::Spawn)?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        let drain = child
            .stderr
            .take()
            .map(|stderr| drain_stderr(stderr, params.ssh_host().to_string(), stderr_tail.clone()));

        let mut session = SshSession {
            child,
            stderr_tail,
            drain,
            grace: self.settings.stop_grace(),
            closed: false,
        };
        session.wait_ready(params.local_binds(), self.settings.connect_timeout())?;
        Ok(Box::new(session))
    }
}

fn drain_stderr(
    stderr: ChildStderr,
    host: String,
    tail: Arc<Mutex<VecDeque<String>>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            let Ok(line) = line else { break };
            debug!("ssh {}: {}", host, line);
            if let Ok(mut tail) = tail.lock() {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    })
}

/// A running `ssh -N` process holding the tunnel's listeners.
pub struct SshSession {
    child: Child,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    drain: Option<JoinHandle<()>>,
    grace: Duration,
    closed: bool,
}

impl SshSession {
    /// Block until every local bind accepts connections, ssh exits, or the timeout passes.
    fn wait_ready(&mut self, binds: &[Bind], timeout: Duration) -> Result<(), SessionError> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.child.try_wait().map_err(SessionError::Spawn)? {
                self.closed = true;
                return Err(SessionError::Exited {
                    status: status.to_string(),
                    stderr: self.stderr_summary(),
                });
            }
            if binds.iter().all(health::check_port) {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(SessionError::Timeout(timeout));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn stderr_summary(&mut self) -> String {
        // the pipe closes once ssh is gone, so the drain finishes
        if let Some(drain) = self.drain.take() {
            let _ = drain.join();
        }
        let tail = match self.stderr_tail.lock() {
            Ok(tail) => tail.iter().cloned().collect::<Vec<_>>().join("; "),
            Err(_) => String::new(),
        };
        if tail.is_empty() {
            "no output".to_string()
        } else {
            tail
        }
    }

    fn wait_exit(&mut self, grace: Duration) -> Result<Option<ExitStatus>, SessionError> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.child.try_wait().map_err(SessionError::Spawn)? {
                return Ok(Some(status));
            }
            if start.elapsed() >= grace {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl ForwardSession for SshSession {
    fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.child.try_wait().map_err(SessionError::Spawn)?.is_some() {
            return Ok(());
        }

        let pid = self.child.id();
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            warn!("SIGTERM to ssh process {} failed: {}", pid, err);
        }

        if self.wait_exit(self.grace)?.is_none() {
            warn!("ssh process {} ignored SIGTERM, killing", pid);
            self.child.kill().map_err(SessionError::Signal)?;
            self.child.wait().map_err(SessionError::Signal)?;
        }
        // detached; it ends when the last holder of the pipe exits
        self.drain.take();
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        !self.closed && matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if !self.closed || matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Map an exit status to a shell-style exit code (128 + signal when killed).
pub fn exit_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

/// Run `command` through `sh -c` with inherited stdio and return its exit code.
///
/// A shutdown request while the command runs is passed on to it as SIGTERM. If the
/// command is still running `grace` later it is killed.
pub fn run_shell(command: &str, signal: &ShutdownSignal, grace: Duration) -> std::io::Result<i32> {
    let mut child = Command::new("sh").arg("-c").arg(command).spawn()?;
    let mut terminated_at: Option<Instant> = None;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(exit_code(status));
        }
        match terminated_at {
            None if signal.is_triggered() => {
                terminated_at = Some(Instant::now());
                unsafe {
                    libc::kill(child.id() as i32, libc::SIGTERM);
                }
            }
            Some(at) if at.elapsed() >= grace => {
                warn!("command did not exit within {:?} of SIGTERM, killing it", grace);
                child.kill()?;
                return Ok(exit_code(child.wait()?));
            }
            _ => {}
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}
