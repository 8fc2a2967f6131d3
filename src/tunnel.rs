use std::ffi::{CStr, CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::error::{SessionError, TunnelError};
use crate::forward::ForwardSpec;

pub const LOOPBACK: &str = "127.0.0.1";

/// A host:port endpoint on either side of a forward.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bind {
    pub host: String,
    pub port: u16,
}

impl Bind {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Bind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Fully resolved parameters for one SSH forwarding session.
///
/// `local_binds[i]` is forwarded to `remote_binds[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelParams {
    ssh_host: String,
    ssh_username: Option<String>,
    ssh_private_key_path: Option<PathBuf>,
    local_binds: Vec<Bind>,
    remote_binds: Vec<Bind>,
}

impl TunnelParams {
    /// Resolve a target expression and its forward expressions into session parameters.
    ///
    /// Forwards with an empty local host bind to `default_local_addr`, or loopback
    /// when that is not given either.
    pub fn build(
        ssh_target: &str,
        forwards: &[String],
        ssh_key_path: Option<&str>,
        default_local_addr: Option<&str>,
    ) -> Result<Self, TunnelError> {
        let (ssh_username, ssh_host) = split_target(ssh_target)?;

        if forwards.is_empty() {
            return Err(TunnelError::MalformedForwardSpec {
                expr: String::new(),
                reason: format!("tunnel via '{}' has no forwards", ssh_target),
            });
        }

        info!("setting up local tunnels via `{}`", ssh_target);

        let default_local = default_local_addr
            .filter(|addr| !addr.is_empty())
            .unwrap_or(LOOPBACK);

        let mut local_binds = Vec::with_capacity(forwards.len());
        let mut remote_binds = Vec::with_capacity(forwards.len());
        for expr in forwards {
            let fwd: ForwardSpec = expr.parse()?;
            let local_host = if fwd.local_host.is_empty() {
                default_local.to_string()
            } else {
                fwd.local_host
            };
            let local = Bind::new(local_host, fwd.local_port);
            let remote = Bind::new(fwd.remote_host, fwd.remote_port);
            info!("    add {} -> {}", local, remote);
            local_binds.push(local);
            remote_binds.push(remote);
        }

        let ssh_private_key_path = ssh_key_path
            .map(|raw| {
                let cwd = std::env::current_dir().ok();
                resolve_key_path(raw, dirs::home_dir().as_deref(), cwd.as_deref())
            })
            .transpose()?;

        Ok(Self {
            ssh_host,
            ssh_username,
            ssh_private_key_path,
            local_binds,
            remote_binds,
        })
    }

    pub fn ssh_host(&self) -> &str {
        &self.ssh_host
    }

    pub fn ssh_username(&self) -> Option<&str> {
        self.ssh_username.as_deref()
    }

    pub fn ssh_private_key_path(&self) -> Option<&Path> {
        self.ssh_private_key_path.as_deref()
    }

    pub fn local_binds(&self) -> &[Bind] {
        &self.local_binds
    }

    pub fn remote_binds(&self) -> &[Bind] {
        &self.remote_binds
    }

    /// Forward pairs in configuration order.
    pub fn pairs(&self) -> impl Iterator<Item = (&Bind, &Bind)> {
        self.local_binds.iter().zip(self.remote_binds())
    }
}

/// Split "user@host" at the first '@'. A bare "host" has no user.
fn split_target(target: &str) -> Result<(Option<String>, String), TunnelError> {
    let invalid = || TunnelError::InvalidTarget(target.to_string());
    match target.split_once('@') {
        Some((user, host)) => {
            if user.is_empty() || host.is_empty() {
                return Err(invalid());
            }
            Ok((Some(user.to_string()), host.to_string()))
        }
        None if target.is_empty() => Err(invalid()),
        None => Ok((None, target.to_string())),
    }
}

/// Expand "~" / "~/..." against `home` and "~user/..." against that user's home
/// directory, then anchor relative paths at `cwd`.
fn resolve_key_path(
    raw: &str,
    home: Option<&Path>,
    cwd: Option<&Path>,
) -> Result<PathBuf, TunnelError> {
    let expanded = match raw.strip_prefix('~') {
        None => PathBuf::from(raw),
        Some(rest) => {
            let (user, tail) = rest.split_once('/').unwrap_or((rest, ""));
            let base = if user.is_empty() {
                home.map(Path::to_path_buf)
            } else {
                user_home(user)
            };
            match base {
                Some(base) if tail.is_empty() => base,
                Some(base) => base.join(tail),
                None if user.is_empty() => PathBuf::from(raw),
                None => {
                    return Err(TunnelError::KeyPath {
                        path: raw.to_string(),
                        reason: format!("no such user '{}'", user),
                    });
                }
            }
        }
    };
    Ok(match cwd {
        Some(cwd) if expanded.is_relative() => cwd.join(expanded),
        _ => expanded,
    })
}

/// Home directory of a local user, from the password database.
fn user_home(user: &str) -> Option<PathBuf> {
    let name = CString::new(user).ok()?;
    let mut entry: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0 as libc::c_char; 4096];
    let mut found: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwnam_r(name.as_ptr(), &mut entry, buf.as_mut_ptr(), buf.len(), &mut found)
    };
    if rc != 0 || found.is_null() || entry.pw_dir.is_null() {
        return None;
    }
    let dir = unsafe { CStr::from_ptr(entry.pw_dir) };
    Some(PathBuf::from(OsStr::from_bytes(dir.to_bytes())))
}

/// A live forwarding session: one SSH connection serving every forward of a tunnel.
pub trait ForwardSession: Send {
    /// Tear down listeners and the SSH connection.
    fn close(&mut self) -> Result<(), SessionError>;

    fn is_alive(&mut self) -> bool;
}

/// Opens forwarding sessions.
pub trait Transport: Send + Sync {
    fn open(&self, params: &TunnelParams) -> Result<Box<dyn ForwardSession>, SessionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    NotStarted,
    Running,
    Stopped,
}

impl TunnelState {
    fn as_str(self) -> &'static str {
        match self {
            TunnelState::NotStarted => "not started",
            TunnelState::Running => "running",
            TunnelState::Stopped => "stopped",
        }
    }
}

/// One SSH connection together with all local forwards it serves.
pub struct Tunnel {
    target: String,
    params: TunnelParams,
    transport: Arc<dyn Transport>,
    session: Option<Box<dyn ForwardSession>>,
    state: TunnelState,
}

impl Tunnel {
    pub fn new(target: impl Into<String>, params: TunnelParams, transport: Arc<dyn Transport>) -> Self {
        Self {
            target: target.into(),
            params,
            transport,
            session: None,
            state: TunnelState::NotStarted,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn params(&self) -> &TunnelParams {
        &self.params
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Open the session and bind every local listener. Only valid once, from `NotStarted`.
    pub fn start(&mut self) -> Result<(), TunnelError> {
        if self.state != TunnelState::NotStarted {
            return Err(TunnelError::InvalidState {
                target: self.target.clone(),
                action: "start",
                state: self.state.as_str(),
            });
        }

        let session = self
            .transport
            .open(&self.params)
            .map_err(|source| TunnelError::TunnelStart {
                target: self.target.clone(),
                source,
            })?;
        self.session = Some(session);
        self.state = TunnelState::Running;
        Ok(())
    }

    /// Close the session if one is open. Calling this again, or before `start`, is a no-op.
    pub fn stop(&mut self) -> Result<(), TunnelError> {
        self.state = TunnelState::Stopped;
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        session.close().map_err(|source| TunnelError::Stop {
            target: self.target.clone(),
            source,
        })
    }

    pub fn is_alive(&mut self) -> bool {
        match self.session.as_mut() {
            Some(session) => session.is_alive(),
            None => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;
    use crate::signal::ShutdownSignal;

    /// Records open/close calls in order; fails `open` for one ssh host.
    #[derive(Default)]
    pub struct FakeTransport {
        pub events: Arc<Mutex<Vec<String>>>,
        pub fail_open_for: Option<String>,
        pub fail_close_for: Option<String>,
        /// Trigger the latch once the named host has been opened.
        pub interrupt_after: Option<(String, ShutdownSignal)>,
    }

    impl FakeTransport {
        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    struct FakeSession {
        host: String,
        events: Arc<Mutex<Vec<String>>>,
        fail_close: bool,
    }

    impl ForwardSession for FakeSession {
        fn close(&mut self) -> Result<(), SessionError> {
            self.events.lock().unwrap().push(format!("close {}", self.host));
            if self.fail_close {
                return Err(SessionError::Signal(std::io::Error::other("boom")));
            }
            Ok(())
        }

        fn is_alive(&mut self) -> bool {
            true
        }
    }

    impl Transport for FakeTransport {
        fn open(&self, params: &TunnelParams) -> Result<Box<dyn ForwardSession>, SessionError> {
            let host = params.ssh_host().to_string();
            self.events.lock().unwrap().push(format!("open {}", host));
            if self.fail_open_for.as_deref() == Some(host.as_str()) {
                return Err(SessionError::Exited {
                    status: "exit status: 255".to_string(),
                    stderr: "Connection refused".to_string(),
                });
            }
            if let Some((after, signal)) = &self.interrupt_after {
                if *after == host {
                    signal.trigger();
                }
            }
            Ok(Box::new(FakeSession {
                fail_close: self.fail_close_for.as_deref() == Some(host.as_str()),
                host,
                events: self.events.clone(),
            }))
        }
    }
}
