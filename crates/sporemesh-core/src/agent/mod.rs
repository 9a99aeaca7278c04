//! The node agent: materializes plans into running subprocesses.
//!
//! Each agent subscribes to the fabric's plan stream and keeps at most one
//! process per app. A plan for a new digest triggers a blue/green cutover:
//! the replacement is brought fully healthy, the endpoint registration is
//! swapped after a warmup interval, and only then is the predecessor
//! killed. Sprout failures are logged and leave the agent's state
//! unchanged; the agent never retries a failed plan on its own.

mod health;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use health::ProbeTimings;

use crate::bundle::{self, BundleError};
use crate::fabric::{Endpoint, Fabric, Plan, PlanStream};
use crate::repo::Repository;

/// Errors raised while reacting to a plan.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentError {
    /// The planned digest has no entry in the repository.
    #[error("bundle {digest} not present in repository")]
    BundleMissing {
        /// The missing digest.
        digest: String,
    },

    /// Bundle verification or extraction failed.
    #[error(transparent)]
    Bundle(#[from] BundleError),

    /// The OS would not hand out an ephemeral port.
    #[error("port allocation failed: {0}")]
    PortAllocationFailed(#[source] io::Error),

    /// The extracted binary could not be started.
    #[error("failed to spawn workload: {0}")]
    SpawnFailed(#[source] io::Error),

    /// The workload never answered its health probe in time.
    #[error("no 200 from {url} within {deadline:?}")]
    HealthTimeout {
        /// The probed URL.
        url: String,
        /// The deadline that elapsed.
        deadline: Duration,
    },

    /// The agent was shut down mid-operation.
    #[error("agent shut down during sprout")]
    Cancelled,
}

/// Timing and placement knobs of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Directory bundles are extracted into; exclusively owned by this
    /// agent.
    pub run_dir: PathBuf,

    /// Dual-running interval between registering a replacement endpoint
    /// and killing the predecessor.
    #[serde(default = "default_warmup")]
    #[serde(with = "humantime_serde")]
    pub warmup: Duration,

    /// Overall deadline for a fresh workload to become healthy.
    #[serde(default = "default_health_deadline")]
    #[serde(with = "humantime_serde")]
    pub health_deadline: Duration,

    /// Pause between consecutive health probes.
    #[serde(default = "default_health_interval")]
    #[serde(with = "humantime_serde")]
    pub health_interval: Duration,

    /// Per-request health-probe timeout.
    #[serde(default = "default_probe_timeout")]
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

const fn default_warmup() -> Duration {
    Duration::from_secs(2)
}

const fn default_health_deadline() -> Duration {
    Duration::from_secs(6)
}

const fn default_health_interval() -> Duration {
    Duration::from_millis(500)
}

const fn default_probe_timeout() -> Duration {
    Duration::from_secs(1)
}

impl AgentConfig {
    /// Creates a config with default timings and the given run directory.
    #[must_use]
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
            warmup: default_warmup(),
            health_deadline: default_health_deadline(),
            health_interval: default_health_interval(),
            probe_timeout: default_probe_timeout(),
        }
    }

    fn probe_timings(&self) -> ProbeTimings {
        ProbeTimings {
            deadline: self.health_deadline,
            interval: self.health_interval,
            request_timeout: self.probe_timeout,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new("./run")
    }
}

/// A live workload instance owned by an agent.
#[derive(Debug)]
pub struct ProcessRecord {
    /// Application name.
    pub app: String,
    /// Digest of the bundle the instance was started from.
    pub digest: String,
    /// Base URL the instance serves on.
    pub url: String,
    /// Port the instance serves on.
    pub port: u16,
    child: Child,
    dir: PathBuf,
}

impl ProcessRecord {
    /// OS process id of the child, if it is still attached.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn kill(&mut self) {
        if let Err(error) = self.child.kill().await {
            debug!(app = %self.app, %error, "failed to kill workload");
        }
    }
}

type AppSlot = Arc<Mutex<Option<ProcessRecord>>>;

/// Per-node supervisor reacting to plans from the fabric.
pub struct Agent {
    id: String,
    fabric: Arc<Fabric>,
    repo: Arc<Repository>,
    config: AgentConfig,
    client: reqwest::Client,
    plans: StdMutex<Option<PlanStream>>,
    apps: StdMutex<HashMap<String, AppSlot>>,
    running: AtomicUsize,
}

impl Agent {
    /// Creates an agent and subscribes it to the fabric's plan stream.
    ///
    /// Subscription happens here, not in [`Self::run`], so every plan
    /// published after construction is observed even if the run task has
    /// not been polled yet.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        fabric: Arc<Fabric>,
        repo: Arc<Repository>,
        config: AgentConfig,
    ) -> Arc<Self> {
        let plans = fabric.subscribe_plans();
        Arc::new(Self {
            id: id.into(),
            fabric,
            repo,
            config,
            client: reqwest::Client::new(),
            plans: StdMutex::new(Some(plans)),
            apps: StdMutex::new(HashMap::new()),
            running: AtomicUsize::new(0),
        })
    }

    /// The agent's node identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of workload instances currently alive on this agent.
    ///
    /// # Panics
    ///
    /// Never; the counter is lock-free.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs the agent until `cancel` fires or the fabric goes away, then
    /// terminates every child and removes this node's endpoints.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock is poisoned (a thread panicked).
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut plans) = self.plans.lock().expect("lock poisoned").take() else {
            error!(agent = %self.id, "agent already running");
            return;
        };

        info!(agent = %self.id, run_dir = %self.config.run_dir.display(), "agent starting");
        if let Err(error) = fs::create_dir_all(&self.config.run_dir) {
            error!(agent = %self.id, %error, "failed to create run directory");
            return;
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                plan = plans.recv() => match plan {
                    Some(plan) => self.dispatch(plan, &cancel),
                    None => break,
                },
            }
        }

        info!(agent = %self.id, "agent stopping");
        self.shutdown().await;
    }

    /// Hands a plan to a task holding the app's slot, so plans for one app
    /// run strictly in sequence while reception and other apps proceed.
    fn dispatch(self: &Arc<Self>, plan: Plan, cancel: &CancellationToken) {
        debug!(agent = %self.id, app = %plan.app, digest = %plan.digest, "plan received");
        let slot = self.slot(&plan.app);
        let agent = Arc::clone(self);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut state = slot.lock().await;
            if cancel.is_cancelled() {
                return;
            }
            agent.handle_plan(plan, &mut state, &cancel).await;
        });
    }

    fn slot(&self, app: &str) -> AppSlot {
        let mut apps = self.apps.lock().expect("lock poisoned");
        Arc::clone(apps.entry(app.to_string()).or_default())
    }

    async fn handle_plan(
        &self,
        plan: Plan,
        state: &mut Option<ProcessRecord>,
        cancel: &CancellationToken,
    ) {
        match state {
            Some(record) if record.digest == plan.digest => {
                debug!(agent = %self.id, app = %plan.app, "already running planned digest");
            }
            Some(_) => {
                info!(agent = %self.id, app = %plan.app, digest = %plan.digest, "starting blue/green cutover");
                match self.blue_green(&plan, state, cancel).await {
                    Ok(()) => info!(agent = %self.id, app = %plan.app, "cutover complete"),
                    Err(error) => {
                        warn!(agent = %self.id, app = %plan.app, %error, "cutover failed; keeping current instance");
                    }
                }
            }
            None => {
                let Some(budget) = self.fabric.budget(&plan.app) else {
                    warn!(agent = %self.id, app = %plan.app, "no budget for app; ignoring plan");
                    return;
                };
                if self.running.load(Ordering::SeqCst) as u64 >= u64::from(budget.max_instances) {
                    warn!(agent = %self.id, app = %plan.app, max_instances = budget.max_instances,
                          "budget exhausted; ignoring plan");
                    return;
                }

                match self.sprout(&plan, cancel).await {
                    Ok(record) => {
                        self.fabric.register_endpoint(Endpoint {
                            app: plan.app.clone(),
                            url: record.url.clone(),
                            node_id: self.id.clone(),
                        });
                        info!(agent = %self.id, app = %plan.app, url = %record.url, "workload serving");
                        *state = Some(record);
                    }
                    Err(error) => {
                        warn!(agent = %self.id, app = %plan.app, %error, "failed to start workload");
                    }
                }
            }
        }
    }

    /// Brings a replacement instance fully healthy before the predecessor
    /// is stopped. On any failure the predecessor keeps serving.
    async fn blue_green(
        &self,
        plan: &Plan,
        state: &mut Option<ProcessRecord>,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let mut replacement = self.sprout(plan, cancel).await?;

        // Both instances serve during warmup so in-flight requests against
        // the old endpoint can drain.
        tokio::select! {
            () = tokio::time::sleep(self.config.warmup) => {}
            () = cancel.cancelled() => {
                replacement.kill().await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                return Err(AgentError::Cancelled);
            }
        }

        self.fabric.register_endpoint(Endpoint {
            app: plan.app.clone(),
            url: replacement.url.clone(),
            node_id: self.id.clone(),
        });

        let predecessor = state.replace(replacement);
        if let Some(mut predecessor) = predecessor {
            debug!(agent = %self.id, app = %plan.app, url = %predecessor.url, "killing predecessor");
            predecessor.kill().await;
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Fetch → verify → extract → spawn → probe. Returns a record whose
    /// child is alive and answering `GET /health`.
    async fn sprout(
        &self,
        plan: &Plan,
        cancel: &CancellationToken,
    ) -> Result<ProcessRecord, AgentError> {
        let spore = self.repo.path(&plan.digest);
        if !spore.exists() {
            return Err(AgentError::BundleMissing {
                digest: plan.digest.clone(),
            });
        }

        let short = plan.digest.get(..8).unwrap_or(&plan.digest);
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let dir = self
            .config
            .run_dir
            .join(format!("{}-{short}-{stamp}", plan.app));

        let (manifest, binary) = bundle::extract(&spore, &dir)?;
        let binary = fs::canonicalize(&binary).map_err(AgentError::SpawnFailed)?;

        let port = allocate_port().map_err(AgentError::PortAllocationFailed)?;
        let url = format!("http://127.0.0.1:{port}");

        debug!(agent = %self.id, app = %plan.app, binary = %binary.display(), port, "spawning workload");
        let child = Command::new(&binary)
            .args(&manifest.args)
            .current_dir(&dir)
            .envs(&manifest.env)
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(AgentError::SpawnFailed)?;

        let mut record = ProcessRecord {
            app: plan.app.clone(),
            digest: plan.digest.clone(),
            url,
            port,
            child,
            dir,
        };

        if let Err(error) = health::await_healthy(
            &self.client,
            &record.url,
            self.config.probe_timings(),
            cancel,
        )
        .await
        {
            record.kill().await;
            return Err(error);
        }

        self.running.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    /// Terminates every child, removes this node's endpoint registrations,
    /// and clears the run directory.
    async fn shutdown(&self) {
        let slots: Vec<AppSlot> = {
            let apps = self.apps.lock().expect("lock poisoned");
            apps.values().map(Arc::clone).collect()
        };

        for slot in slots {
            let mut state = slot.lock().await;
            if let Some(mut record) = state.take() {
                info!(agent = %self.id, app = %record.app, "terminating workload");
                record.kill().await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                self.fabric.unregister_endpoint(&record.app, &self.id);
                if let Err(error) = fs::remove_dir_all(&record.dir) {
                    debug!(agent = %self.id, %error, "failed to remove extraction directory");
                }
            }
        }

        // Leftovers from failed sprouts and replaced predecessors live
        // here too; the run directory is exclusively this agent's.
        if let Err(error) = fs::remove_dir_all(&self.config.run_dir) {
            debug!(agent = %self.id, %error, "failed to clear run directory");
        }
    }
}

fn allocate_port() -> io::Result<u16> {
    // Bind-then-close: the OS picks an ephemeral port. The window between
    // closing and the child binding is an accepted race.
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
