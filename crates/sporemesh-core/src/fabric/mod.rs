//! The control fabric: plans, budgets, and the endpoint registry.
//!
//! One `Fabric` exists per process. Budget and endpoint tables live under a
//! reader/writer lock and hand out snapshots; plans ride a bounded
//! broadcast channel so publishers never block. A subscriber that falls
//! behind its buffer loses its oldest pending plans (plans are idempotent
//! by `(app, digest)`, so a lost plan is superseded by any later one).

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Depth of the plan broadcast buffer per subscriber.
pub const PLAN_CHANNEL_DEPTH: usize = 128;

/// A declarative rollout message: "app should run digest".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Application name.
    pub app: String,
    /// Repository digest of the bundle to run.
    pub digest: String,
    /// Minimum instance-count hint.
    pub min: u32,
    /// Maximum instance-count hint.
    pub max: u32,
    /// Fixed port, or 0 to let agents choose.
    pub port: u16,
}

/// Advisory resource caps for an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Application name.
    pub app: String,
    /// Replica cap an agent will respect before starting an instance.
    pub max_instances: u32,
    /// Advisory CPU cap in milli-cores.
    pub cpu_milli: u32,
    /// Advisory memory cap in mebibytes.
    pub memory_mb: u32,
}

/// A reachable instance of an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Application name.
    pub app: String,
    /// Base URL, `http://127.0.0.1:<port>`.
    pub url: String,
    /// Identifier of the agent hosting the instance.
    pub node_id: String,
}

#[derive(Default)]
struct Tables {
    budgets: HashMap<String, Budget>,
    endpoints: HashMap<String, Vec<Endpoint>>,
}

/// In-process control plane shared by agents, publishers, and the edge.
pub struct Fabric {
    tables: RwLock<Tables>,
    plans: broadcast::Sender<Plan>,
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new()
    }
}

impl Fabric {
    /// Creates a fabric with the default plan-buffer depth.
    #[must_use]
    pub fn new() -> Self {
        Self::with_plan_depth(PLAN_CHANNEL_DEPTH)
    }

    /// Creates a fabric with a custom plan-buffer depth (must be ≥ 1).
    #[must_use]
    pub fn with_plan_depth(depth: usize) -> Self {
        let (plans, _) = broadcast::channel(depth.max(1));
        Self {
            tables: RwLock::new(Tables::default()),
            plans,
        }
    }

    /// Publishes a plan to every current subscriber. Never blocks; with no
    /// subscribers the plan is dropped.
    pub fn publish_plan(&self, plan: Plan) {
        debug!(app = %plan.app, digest = %plan.digest, "publishing plan");
        if self.plans.send(plan).is_err() {
            debug!("no plan subscribers; plan dropped");
        }
    }

    /// Returns an independent stream observing every plan published after
    /// this call, subject to the per-subscriber drop policy.
    #[must_use]
    pub fn subscribe_plans(&self) -> PlanStream {
        PlanStream {
            rx: self.plans.subscribe(),
        }
    }

    /// Sets the budget for an app. Last writer wins.
    ///
    /// # Panics
    ///
    /// Panics if the table lock is poisoned (a thread panicked).
    pub fn set_budget(&self, budget: Budget) {
        let mut tables = self.tables.write().expect("lock poisoned");
        tables.budgets.insert(budget.app.clone(), budget);
    }

    /// Returns the budget for an app, if one was set.
    ///
    /// # Panics
    ///
    /// Panics if the table lock is poisoned (a thread panicked).
    #[must_use]
    pub fn budget(&self, app: &str) -> Option<Budget> {
        let tables = self.tables.read().expect("lock poisoned");
        tables.budgets.get(app).cloned()
    }

    /// Registers an endpoint. An existing entry for the same
    /// `(app, node_id)` is replaced in place, keeping at most one endpoint
    /// per node per app.
    ///
    /// # Panics
    ///
    /// Panics if the table lock is poisoned (a thread panicked).
    pub fn register_endpoint(&self, endpoint: Endpoint) {
        let mut tables = self.tables.write().expect("lock poisoned");
        let entries = tables.endpoints.entry(endpoint.app.clone()).or_default();
        if let Some(existing) = entries.iter_mut().find(|e| e.node_id == endpoint.node_id) {
            *existing = endpoint;
        } else {
            entries.push(endpoint);
        }
    }

    /// Removes the endpoint a node registered for an app, if any.
    ///
    /// # Panics
    ///
    /// Panics if the table lock is poisoned (a thread panicked).
    pub fn unregister_endpoint(&self, app: &str, node_id: &str) {
        let mut tables = self.tables.write().expect("lock poisoned");
        if let Some(entries) = tables.endpoints.get_mut(app) {
            entries.retain(|e| e.node_id != node_id);
            if entries.is_empty() {
                tables.endpoints.remove(app);
            }
        }
    }

    /// Returns a snapshot of the endpoints currently registered for an app.
    ///
    /// # Panics
    ///
    /// Panics if the table lock is poisoned (a thread panicked).
    #[must_use]
    pub fn endpoints(&self, app: &str) -> Vec<Endpoint> {
        let tables = self.tables.read().expect("lock poisoned");
        tables.endpoints.get(app).cloned().unwrap_or_default()
    }
}

/// Receive side of the plan pub/sub surface.
pub struct PlanStream {
    rx: broadcast::Receiver<Plan>,
}

impl PlanStream {
    /// Receives the next plan, or `None` once the fabric is gone.
    ///
    /// A lag (the subscriber fell more than the buffer depth behind) is
    /// logged and skipped; reception continues with the oldest retained
    /// plan.
    pub async fn recv(&mut self) -> Option<Plan> {
        loop {
            match self.rx.recv().await {
                Ok(plan) => return Some(plan),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "plan subscriber lagged; oldest plans dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(app: &str, node: &str, port: u16) -> Endpoint {
        Endpoint {
            app: app.into(),
            url: format!("http://127.0.0.1:{port}"),
            node_id: node.into(),
        }
    }

    #[test]
    fn test_budget_last_writer_wins() {
        let fabric = Fabric::new();
        fabric.set_budget(Budget {
            app: "x".into(),
            max_instances: 1,
            cpu_milli: 100,
            memory_mb: 64,
        });
        fabric.set_budget(Budget {
            app: "x".into(),
            max_instances: 4,
            cpu_milli: 100,
            memory_mb: 64,
        });

        assert_eq!(fabric.budget("x").unwrap().max_instances, 4);
        assert!(fabric.budget("y").is_none());
    }

    #[test]
    fn test_register_replaces_per_node() {
        let fabric = Fabric::new();
        fabric.register_endpoint(endpoint("x", "node-1", 1000));
        fabric.register_endpoint(endpoint("x", "node-2", 2000));
        fabric.register_endpoint(endpoint("x", "node-1", 3000));

        let endpoints = fabric.endpoints("x");
        assert_eq!(endpoints.len(), 2);
        let node_1 = endpoints.iter().find(|e| e.node_id == "node-1").unwrap();
        assert_eq!(node_1.url, "http://127.0.0.1:3000");
    }

    #[test]
    fn test_endpoints_returns_snapshot() {
        let fabric = Fabric::new();
        fabric.register_endpoint(endpoint("x", "node-1", 1000));

        let mut snapshot = fabric.endpoints("x");
        snapshot.clear();
        assert_eq!(fabric.endpoints("x").len(), 1);
    }

    #[test]
    fn test_unregister_endpoint() {
        let fabric = Fabric::new();
        fabric.register_endpoint(endpoint("x", "node-1", 1000));
        fabric.register_endpoint(endpoint("x", "node-2", 2000));

        fabric.unregister_endpoint("x", "node-1");
        let endpoints = fabric.endpoints("x");
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].node_id, "node-2");

        fabric.unregister_endpoint("x", "node-2");
        assert!(fabric.endpoints("x").is_empty());
    }

    #[tokio::test]
    async fn test_existing_subscriber_observes_plan() {
        let fabric = Fabric::new();
        let mut plans = fabric.subscribe_plans();

        fabric.publish_plan(Plan {
            app: "x".into(),
            digest: "d1".into(),
            min: 1,
            max: 1,
            port: 0,
        });

        let plan = plans.recv().await.unwrap();
        assert_eq!(plan.app, "x");
        assert_eq!(plan.digest, "d1");
    }

    #[tokio::test]
    async fn test_subscribers_are_independent() {
        let fabric = Fabric::new();
        let mut first = fabric.subscribe_plans();
        let mut second = fabric.subscribe_plans();

        fabric.publish_plan(Plan {
            app: "x".into(),
            digest: "d1".into(),
            min: 1,
            max: 1,
            port: 0,
        });

        assert_eq!(first.recv().await.unwrap().digest, "d1");
        assert_eq!(second.recv().await.unwrap().digest, "d1");
    }

    #[tokio::test]
    async fn test_per_subscriber_order_matches_publish_order() {
        let fabric = Fabric::new();
        let mut plans = fabric.subscribe_plans();

        for digest in ["d1", "d2", "d3"] {
            fabric.publish_plan(Plan {
                app: "x".into(),
                digest: digest.into(),
                min: 1,
                max: 1,
                port: 0,
            });
        }

        assert_eq!(plans.recv().await.unwrap().digest, "d1");
        assert_eq!(plans.recv().await.unwrap().digest, "d2");
        assert_eq!(plans.recv().await.unwrap().digest, "d3");
    }

    #[tokio::test]
    async fn test_lagged_subscriber_skips_oldest_and_recovers() {
        let fabric = Fabric::with_plan_depth(2);
        let mut plans = fabric.subscribe_plans();

        for i in 0..5 {
            fabric.publish_plan(Plan {
                app: "x".into(),
                digest: format!("d{i}"),
                min: 1,
                max: 1,
                port: 0,
            });
        }

        // Depth 2: only the newest two plans survive for this subscriber.
        assert_eq!(plans.recv().await.unwrap().digest, "d3");
        assert_eq!(plans.recv().await.unwrap().digest, "d4");
    }

    #[tokio::test]
    async fn test_stream_ends_when_fabric_dropped() {
        let fabric = Fabric::new();
        let mut plans = fabric.subscribe_plans();
        drop(fabric);
        assert!(plans.recv().await.is_none());
    }
}
