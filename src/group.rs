use std::collections::HashMap;
use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::conf::{self, TunnelConfig};
use crate::error::TunnelError;
use crate::process;
use crate::signal::ShutdownSignal;
use crate::tunnel::{Bind, Transport, Tunnel, TunnelParams, TunnelState};

const WAIT_POLL: Duration = Duration::from_millis(500);
const DEFAULT_EXEC_GRACE: Duration = Duration::from_secs(2);

/// How the start phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Startup {
    /// Every tunnel is running.
    Complete,
    /// Shutdown was requested midway; the tunnels started so far are stopped again.
    Interrupted,
}

/// Result of stopping one tunnel during group shutdown.
#[derive(Debug)]
pub struct StopOutcome {
    pub target: String,
    pub result: Result<(), TunnelError>,
}

/// Every tunnel of one process run, started and stopped together in config order.
pub struct TunnelGroup {
    tunnels: Vec<Tunnel>,
    exec_grace: Duration,
}

impl TunnelGroup {
    /// Load each config file in order and build one tunnel per entry.
    pub fn load(
        conf_files: &[String],
        default_local_addr: Option<&str>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, TunnelError> {
        let mut configs = Vec::new();
        for reference in conf_files {
            configs.extend(conf::load(reference)?);
        }
        Self::from_configs(&configs, default_local_addr, transport)
    }

    pub fn from_configs(
        configs: &[TunnelConfig],
        default_local_addr: Option<&str>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, TunnelError> {
        let mut owners: HashMap<Bind, String> = HashMap::new();
        let mut tunnels = Vec::with_capacity(configs.len());

        for conf in configs {
            let params = TunnelParams::build(
                &conf.ssh_target,
                &conf.forwards,
                conf.ssh_key_path.as_deref(),
                default_local_addr,
            )?;
            for bind in params.local_binds() {
                if let Some(first) = owners.insert(bind.clone(), conf.ssh_target.clone()) {
                    return Err(TunnelError::DuplicateLocalBind {
                        bind: bind.to_string(),
                        first,
                        second: conf.ssh_target.clone(),
                    });
                }
            }
            tunnels.push(Tunnel::new(conf.ssh_target.clone(), params, transport.clone()));
        }

        Ok(Self {
            tunnels,
            exec_grace: DEFAULT_EXEC_GRACE,
        })
    }

    /// How long an `--exec` command gets between SIGTERM and SIGKILL on shutdown.
    pub fn with_exec_grace(mut self, grace: Duration) -> Self {
        self.exec_grace = grace;
        self
    }

    pub fn tunnels(&self) -> &[Tunnel] {
        &self.tunnels
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Start tunnels in order. On the first failure every tunnel started so far is
    /// stopped and the error is returned; later tunnels are never started.
    ///
    /// The shutdown latch is checked before each tunnel, so a signal during a slow
    /// start rolls back the same way without opening the rest.
    pub fn start_all(&mut self, signal: &ShutdownSignal) -> Result<Startup, TunnelError> {
        for i in 0..self.tunnels.len() {
            if signal.is_triggered() {
                info!("shutdown requested while starting tunnels");
                self.stop_all();
                return Ok(Startup::Interrupted);
            }
            info!("starting tunnel `{}`", self.tunnels[i].target());
            if let Err(e) = self.tunnels[i].start() {
                error!("tunnel `{}` failed to start: {}", self.tunnels[i].target(), chain(&e));
                self.stop_all();
                return Err(e);
            }
        }
        info!("started {} tunnel(s)", self.tunnels.len());
        Ok(Startup::Complete)
    }

    /// Stop every tunnel in start order. Failures are logged and never cut shutdown short.
    pub fn stop_all(&mut self) -> Vec<StopOutcome> {
        let mut outcomes = Vec::with_capacity(self.tunnels.len());
        for tunnel in &mut self.tunnels {
            let was_running = tunnel.state() == TunnelState::Running;
            let result = tunnel.stop();
            match &result {
                Ok(()) if was_running => info!("stopped tunnel `{}`", tunnel.target()),
                Ok(()) => {}
                Err(e) => warn!("failed to stop tunnel `{}`: {}", tunnel.target(), chain(e)),
            }
            outcomes.push(StopOutcome {
                target: tunnel.target().to_string(),
                result,
            });
        }
        outcomes
    }

    /// Start everything, then either wait for a shutdown signal or run `exec` through
    /// the shell. Tunnels are always stopped before returning.
    ///
    /// Returns the exit code for the process: the command's code, or 0 after a signal.
    /// A signal that arrives during startup skips `exec` entirely.
    pub fn run(&mut self, exec: Option<&str>, signal: &ShutdownSignal) -> Result<i32, TunnelError> {
        if self.start_all(signal)? == Startup::Interrupted {
            return Ok(0);
        }

        let outcome = match exec {
            None => {
                self.wait_for_shutdown(signal);
                Ok(0)
            }
            Some(command) => {
                info!("execute {}", command);
                process::run_shell(command, signal, self.exec_grace).map_err(|source| {
                    TunnelError::Exec {
                        command: command.to_string(),
                        source,
                    }
                })
            }
        };

        let failed: Vec<String> = self
            .stop_all()
            .into_iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.target)
            .collect();
        if !failed.is_empty() {
            warn!(
                "{} of {} tunnel(s) did not stop cleanly: {}",
                failed.len(),
                self.tunnels.len(),
                failed.join(", ")
            );
        }
        outcome
    }

    fn wait_for_shutdown(&mut self, signal: &ShutdownSignal) {
        let mut reported = vec![false; self.tunnels.len()];
        while !signal.is_triggered() {
            for (tunnel, reported) in self.tunnels.iter_mut().zip(reported.iter_mut()) {
                if !*reported && !tunnel.is_alive() {
                    *reported = true;
                    warn!("tunnel `{}` is no longer running", tunnel.target());
                }
            }
            std::thread::sleep(WAIT_POLL);
        }
        info!("shutdown requested");
    }
}

impl Drop for TunnelGroup {
    fn drop(&mut self) {
        for tunnel in &mut self.tunnels {
            if tunnel.state() == TunnelState::Running {
                let _ = tunnel.stop();
            }
        }
    }
}

fn chain(e: &TunnelError) -> String {
    let mut parts = vec![e.to_string()];
    let mut source = std::error::Error::source(e);
    while let Some(s) = source {
        parts.push(s.to_string());
        source = s.source();
    }
    parts.join(": ")
}
