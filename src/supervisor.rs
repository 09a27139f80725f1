use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::health;
use crate::process::shell_command;

/// Everything needed to locate, start, and health-check one logical
/// external service. `name` is the dedup key for concurrent starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    /// Exported to the child as PORT
    pub port: u16,
    pub base_url: String,
    /// Probed relative to base_url; any 2xx means healthy
    pub health_path: String,
    /// Shell command that starts the service
    pub start_cmd: String,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub start_timeout: Duration,
}

impl ServiceDescriptor {
    fn health_url(&self) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.health_path
        )
    }
}

/// Observable lifecycle of one supervised service.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ServiceStatus {
    Idle,
    Starting,
    Running { url: String },
    Failed { error: String },
}

type StartOutcome = Result<String>;
type OutcomeReceiver = watch::Receiver<Option<StartOutcome>>;

struct ServiceState {
    status: ServiceStatus,
    /// Completion signal of the in-flight start attempt, present while
    /// Starting. Every concurrent caller awaits this same receiver.
    attempt: Option<OutcomeReceiver>,
    /// Handle to the child we spawned, if any. Dropping it does not kill
    /// the process; only stop() does.
    child: Option<Child>,
    cwd: Option<PathBuf>,
}

impl ServiceState {
    fn idle() -> Self {
        Self {
            status: ServiceStatus::Idle,
            attempt: None,
            child: None,
            cwd: None,
        }
    }
}

/// Ensures named external HTTP services are up and reachable.
///
/// ensure() with the same name is single-flight: N concurrent callers
/// share one spawn and one health-poll loop, and all resolve to the same
/// outcome. The name -> state map is the only shared state; every
/// check-then-transition happens under its lock, and the lock is never
/// held across an await.
pub struct ServiceSupervisor {
    services: Arc<Mutex<HashMap<String, ServiceState>>>,
    poll_interval: Duration,
    probe_timeout: Duration,
}

impl ServiceSupervisor {
    pub fn new() -> Self {
        Self::with_timing(health::POLL_INTERVAL, health::PROBE_TIMEOUT)
    }

    pub fn with_timing(poll_interval: Duration, probe_timeout: Duration) -> Self {
        Self {
            services: Arc::new(Mutex::new(HashMap::new())),
            poll_interval,
            probe_timeout,
        }
    }

    /// Resolve the base URL of the named service, starting it if needed.
    ///
    /// Fast path: Running plus a fresh successful health check returns the
    /// cached URL without spawning. If a start is already in flight the
    /// call attaches to it and returns its eventual outcome. Otherwise
    /// this call initiates the (single) start attempt.
    pub async fn ensure(&self, descriptor: &ServiceDescriptor) -> Result<String> {
        enum Action {
            Probe(String),
            Wait(OutcomeReceiver),
        }

        loop {
            let action = {
                let mut services = self.services.lock();
                let state = services
                    .entry(descriptor.name.clone())
                    .or_insert_with(ServiceState::idle);

                // A service started under a different working directory is
                // stale: kill our child and re-evaluate from scratch.
                if !matches!(state.status, ServiceStatus::Starting) {
                    if let (Some(prev), Some(next)) = (state.cwd.as_ref(), descriptor.cwd.as_ref())
                    {
                        if prev != next {
                            warn!(
                                "Service '{}' cwd changed ({} -> {}), restarting",
                                descriptor.name,
                                prev.display(),
                                next.display()
                            );
                            if let Some(mut child) = state.child.take() {
                                let _ = child.start_kill();
                            }
                            state.status = ServiceStatus::Idle;
                            state.cwd = None;
                        }
                    }
                }

                match &state.status {
                    ServiceStatus::Running { url } => Action::Probe(url.clone()),
                    ServiceStatus::Starting => match state.attempt.clone() {
                        Some(rx) => Action::Wait(rx),
                        None => {
                            // Starting with no attempt channel means the
                            // attempt task died before finalizing; recover.
                            state.status = ServiceStatus::Idle;
                            continue;
                        }
                    },
                    ServiceStatus::Idle | ServiceStatus::Failed { .. } => {
                        let (tx, rx) = watch::channel(None);
                        state.status = ServiceStatus::Starting;
                        state.attempt = Some(rx.clone());
                        self.launch_attempt(descriptor.clone(), tx);
                        Action::Wait(rx)
                    }
                }
            };

            match action {
                Action::Probe(url) => {
                    if health::is_up(&descriptor.health_url(), self.probe_timeout).await {
                        return Ok(url);
                    }
                    // Cached URL went stale; demote to Idle (unless someone
                    // else already transitioned it) and re-evaluate.
                    let mut services = self.services.lock();
                    if let Some(state) = services.get_mut(&descriptor.name) {
                        if matches!(&state.status, ServiceStatus::Running { url: u } if *u == url) {
                            info!(
                                "Service '{}' no longer answers health checks, resetting",
                                descriptor.name
                            );
                            state.status = ServiceStatus::Idle;
                        }
                    }
                }
                Action::Wait(mut rx) => {
                    loop {
                        let outcome = rx.borrow_and_update().clone();
                        if let Some(outcome) = outcome {
                            return outcome;
                        }
                        if rx.changed().await.is_err() {
                            // Attempt task vanished without an outcome;
                            // go around and re-evaluate the state.
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Run the start attempt on a detached task so a caller that stops
    /// waiting never cancels it for the others.
    fn launch_attempt(&self, descriptor: ServiceDescriptor, tx: watch::Sender<Option<StartOutcome>>) {
        let services = Arc::clone(&self.services);
        let poll_interval = self.poll_interval;
        let probe_timeout = self.probe_timeout;
        tokio::spawn(async move {
            let (outcome, child) =
                start_attempt(&descriptor, poll_interval, probe_timeout).await;
            {
                let mut map = services.lock();
                if let Some(state) = map.get_mut(&descriptor.name) {
                    state.status = match &outcome {
                        Ok(url) => ServiceStatus::Running { url: url.clone() },
                        Err(e) => ServiceStatus::Failed {
                            error: e.to_string(),
                        },
                    };
                    if let Some(child) = child {
                        // Replacing a previous handle only drops it; the
                        // old process, if any, keeps running.
                        state.child = Some(child);
                        state.cwd = descriptor.cwd.clone();
                    }
                    state.attempt = None;
                }
            }
            let _ = tx.send(Some(outcome));
        });
    }

    /// Current lifecycle state of a service, if it has ever been asked for.
    pub fn status(&self, name: &str) -> Option<ServiceStatus> {
        self.services.lock().get(name).map(|s| s.status.clone())
    }

    /// Kill the child we own for this service (if any) and forget it.
    /// Returns false if the name was never seen.
    pub fn stop(&self, name: &str) -> bool {
        let state = self.services.lock().remove(name);
        match state {
            Some(mut state) => {
                if let Some(mut child) = state.child.take() {
                    match child.start_kill() {
                        Ok(()) => info!("Stopped service '{}'", name),
                        Err(e) => warn!("Failed to kill service '{}': {}", name, e),
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Stop every supervised service. For embedding-app shutdown.
    pub fn stop_all(&self) {
        let names: Vec<String> = self.services.lock().keys().cloned().collect();
        for name in names {
            self.stop(&name);
        }
    }
}

impl Default for ServiceSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// One full start attempt: probe, spawn, poll until healthy or timeout.
/// On timeout the child is deliberately left running since it may still
/// become healthy; the returned handle lets stop() reach it later.
async fn start_attempt(
    descriptor: &ServiceDescriptor,
    poll_interval: Duration,
    probe_timeout: Duration,
) -> (StartOutcome, Option<Child>) {
    let health_url = descriptor.health_url();

    // The service may already be up (started externally or surviving a
    // restart of this process); never spawn a second copy of it.
    if health::is_up(&health_url, probe_timeout).await {
        info!(
            "Service '{}' already answering at {}",
            descriptor.name, descriptor.base_url
        );
        return (Ok(descriptor.base_url.clone()), None);
    }

    if descriptor.start_cmd.trim().is_empty() {
        return (
            Err(OrchestratorError::SpawnFailure(format!(
                "missing start command for '{}'",
                descriptor.name
            ))),
            None,
        );
    }

    let mut cmd = shell_command(&descriptor.start_cmd);
    if let Some(cwd) = &descriptor.cwd {
        cmd.current_dir(cwd);
    }
    cmd.envs(&descriptor.env)
        .env("PORT", descriptor.port.to_string())
        .stdin(Stdio::null());

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!("Failed to spawn service '{}': {}", descriptor.name, e);
            return (
                Err(OrchestratorError::SpawnFailure(e.to_string())),
                None,
            );
        }
    };
    info!(
        "Spawned service '{}' (PID: {:?}), polling {}",
        descriptor.name,
        child.id(),
        health_url
    );

    let healthy = health::wait_for_health(
        &health_url,
        descriptor.start_timeout,
        poll_interval,
        probe_timeout,
    )
    .await;

    if healthy {
        info!("Service '{}' is healthy", descriptor.name);
        (Ok(descriptor.base_url.clone()), Some(child))
    } else {
        // Best-effort policy: the process stays up, it may yet finish
        // booting and a later ensure() will find it healthy.
        warn!(
            "Service '{}' not healthy after {:?}, leaving process running",
            descriptor.name, descriptor.start_timeout
        );
        (
            Err(OrchestratorError::StartTimeout {
                name: descriptor.name.clone(),
                timeout_ms: descriptor.start_timeout.as_millis() as u64,
            }),
            Some(child),
        )
    }
}
