//! System-wide provisioning state machine.
//!
//! The system machine walks `initializing → creating → load_balancing →
//! provisioning → complete`, creating one node machine per node at the
//! `creating` transition and driving each through its own lifecycle. Any
//! failure funnels into a single error-handling decision: tear the whole
//! system down and restart from scratch, or — once the retry bound is
//! exhausted — halt in the terminal `failed` state.
//!
//! All system-level state is mutated by one async run loop; the spawned
//! per-node tasks share only their own machines' observable state, which
//! the run loop samples through poll-and-deadline waits.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use formation_core::template::{self, Bindings};
use formation_core::{Node, Settings, System, ambient_opt, ambient_str};
use formation_provider::{
    BalancerStatus, DnsProvider, LoadBalancer, Provider, ProviderError, RegistryError, retry,
};

use crate::error::{EngineError, EngineResult};
use crate::node::{NodeProvisioner, NodeState};
use crate::poll::{PollOutcome, PollTiming, poll};

/// Lifecycle state of a provisioning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    Initializing,
    Creating,
    LoadBalancing,
    Provisioning,
    Complete,
    HandlingError,
    Failed,
}

impl SystemState {
    pub fn as_str(self) -> &'static str {
        match self {
            SystemState::Initializing => "initializing",
            SystemState::Creating => "creating",
            SystemState::LoadBalancing => "load_balancing",
            SystemState::Provisioning => "provisioning",
            SystemState::Complete => "complete",
            SystemState::HandlingError => "handling_error",
            SystemState::Failed => "failed",
        }
    }

    /// Whether the run has ended, successfully or not.
    pub fn is_terminal(self) -> bool {
        matches!(self, SystemState::Complete | SystemState::Failed)
    }
}

impl std::fmt::Display for SystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events accepted by the system machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEvent {
    Initialized,
    Created,
    LoadBalanced,
    Provisioned,
    ErrorOccurred,
    CreationHalted,
    Reclaimed,
}

impl SystemEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            SystemEvent::Initialized => "initialized",
            SystemEvent::Created => "created",
            SystemEvent::LoadBalanced => "load_balanced",
            SystemEvent::Provisioned => "provisioned",
            SystemEvent::ErrorOccurred => "error_occurred",
            SystemEvent::CreationHalted => "creation_halted",
            SystemEvent::Reclaimed => "reclaimed",
        }
    }
}

/// The declared transition table. Undeclared (state, event) pairs are
/// explicit errors, never silent no-ops.
pub fn system_transition(state: SystemState, event: SystemEvent) -> EngineResult<SystemState> {
    use SystemEvent as E;
    use SystemState as S;

    let next = match (state, event) {
        (S::Initializing, E::Initialized) => S::Creating,
        (S::Creating, E::Created) => S::LoadBalancing,
        (S::LoadBalancing, E::LoadBalanced) => S::Provisioning,
        (S::Provisioning, E::Provisioned) => S::Complete,
        (_, E::ErrorOccurred) => S::HandlingError,
        (_, E::CreationHalted) => S::Failed,
        (_, E::Reclaimed) => S::Initializing,
        (state, event) => {
            return Err(EngineError::InvalidTransition {
                state: state.as_str(),
                event: event.as_str(),
            });
        }
    };
    Ok(next)
}

/// Counter of nodes that reported provisioning completion.
///
/// Shared between the system machine and its node machines; also the
/// handle behind the externally fired `node_provisioned` signal.
#[derive(Debug, Default)]
pub struct CompletionTally(AtomicUsize);

impl CompletionTally {
    /// Record one completion, returning the new count.
    pub fn record(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

/// The external collaborators a provisioning run talks to, resolved by
/// name from the plugin registries before the run starts.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn Provider>,
    pub balancer: Option<Arc<dyn LoadBalancer>>,
    pub dns: Option<Arc<dyn DnsProvider>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("provider", &self.provider.name())
            .field("balancer", &self.balancer.as_ref().map(|b| b.name()))
            .field("dns", &self.dns.as_ref().map(|d| d.name()))
            .finish()
    }
}

/// Drives one system through creation, load balancing, and
/// dependency-ordered provisioning, retrying the whole sequence on
/// recoverable failures up to the configured bound.
pub struct SystemProvisioner {
    system: System,
    settings: Settings,
    collab: Collaborators,
    tag: String,
    timing: PollTiming,
    max_failures: u32,
    failures: u32,
    time_used: Duration,
    last_error: Option<EngineError>,
    state_tx: watch::Sender<SystemState>,
    tally: Arc<CompletionTally>,
    machines: BTreeMap<String, Arc<NodeProvisioner>>,
}

impl SystemProvisioner {
    pub fn new(system: System, settings: Settings, collab: Collaborators) -> Self {
        let tag = ambient_str("tag", None, &system, &settings)
            .unwrap_or_else(|| "formation".to_string());
        let timing = PollTiming::from_settings(&settings);
        let max_failures = settings.max_failures;
        let (state_tx, _) = watch::channel(SystemState::Initializing);
        Self {
            system,
            settings,
            collab,
            tag,
            timing,
            max_failures,
            failures: 0,
            time_used: Duration::ZERO,
            last_error: None,
            state_tx,
            tally: Arc::new(CompletionTally::default()),
            machines: BTreeMap::new(),
        }
    }

    // ── Observability ──────────────────────────────────────────────

    /// Observable state snapshot.
    pub fn state(&self) -> SystemState {
        *self.state_tx.borrow()
    }

    /// Watch channel for state changes, for long-lived callers.
    pub fn subscribe(&self) -> watch::Receiver<SystemState> {
        self.state_tx.subscribe()
    }

    /// Wall-clock time accumulated across all transitions so far.
    pub fn time_used(&self) -> Duration {
        self.time_used
    }

    /// System-level failures recorded so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// The error behind the most recent failure escalation.
    pub fn last_error(&self) -> Option<&EngineError> {
        self.last_error.as_ref()
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    /// Per-node state snapshot.
    pub fn node_states(&self) -> BTreeMap<String, NodeState> {
        self.machines
            .iter()
            .map(|(name, machine)| (name.clone(), machine.state()))
            .collect()
    }

    /// Serializable status snapshot for a front-end.
    pub fn describe(&self) -> Value {
        json!({
            "state": self.state(),
            "failures": self.failures,
            "last_error": self.last_error.as_ref().map(|e| e.to_string()),
            "time_used_secs": self.time_used.as_secs_f64(),
            "nodes": self.node_states(),
            "system": self.system.describe(),
        })
    }

    /// Handle for firing the external completion signal while the run
    /// loop owns the provisioner.
    pub fn completion_handle(&self) -> Arc<CompletionTally> {
        self.tally.clone()
    }

    /// Record one externally observed node completion.
    pub fn node_provisioned(&self) {
        self.tally.record();
    }

    // ── Run loop ───────────────────────────────────────────────────

    /// Drive the machine from `initializing` to a terminal state.
    pub async fn run(&mut self) -> SystemState {
        let mut event = SystemEvent::Initialized;
        loop {
            let next = match system_transition(self.state(), event) {
                Ok(next) => next,
                Err(e) => {
                    error!(system = %self.tag, error = %e, "refusing undeclared transition");
                    break;
                }
            };
            debug!(system = %self.tag, from = %self.state(), to = %next, "system transition");
            self.state_tx.send_replace(next);

            let started = Instant::now();
            let step = self.enter(next).await;
            self.time_used += started.elapsed();

            event = match step {
                Ok(Some(next_event)) => next_event,
                Ok(None) => break,
                Err(e) => {
                    error!(system = %self.tag, error = %e, "provisioning step failed");
                    self.last_error = Some(e);
                    SystemEvent::ErrorOccurred
                }
            };
        }
        self.state()
    }

    /// Transition action dispatch: run the action for the state just
    /// entered and name the event that continues the sequence.
    async fn enter(&mut self, state: SystemState) -> EngineResult<Option<SystemEvent>> {
        match state {
            SystemState::Initializing => Ok(Some(SystemEvent::Initialized)),
            SystemState::Creating => {
                self.create().await?;
                Ok(Some(SystemEvent::Created))
            }
            SystemState::LoadBalancing => {
                self.load_balance().await?;
                Ok(Some(SystemEvent::LoadBalanced))
            }
            SystemState::Provisioning => {
                self.provision().await?;
                Ok(Some(SystemEvent::Provisioned))
            }
            SystemState::Complete => {
                self.system_provisioned().await?;
                Ok(None)
            }
            SystemState::HandlingError => Ok(Some(self.error_handler().await)),
            SystemState::Failed => Ok(None),
        }
    }

    // ── Transition actions ─────────────────────────────────────────

    /// Spawn a node machine per node and wait until every node reaches
    /// `ready_to_provision`.
    async fn create(&mut self) -> EngineResult<()> {
        info!(system = %self.tag, nodes = self.system.len(), "creating system");
        self.tally.reset();
        self.machines.clear();

        for node in self.system.nodes() {
            let machine = Arc::new(NodeProvisioner::new(
                node.clone(),
                self.collab.provider.clone(),
                self.timing,
                self.tally.clone(),
            ));
            self.machines.insert(node.name.clone(), machine.clone());
            tokio::spawn(async move {
                if let Err(e) = machine.initialized().await {
                    warn!(node = %machine.name(), error = %e, "node creation failed");
                    machine.fail_with(e);
                }
            });
        }

        let machines: Vec<Arc<NodeProvisioner>> = self.machines.values().cloned().collect();
        let watched = &machines;
        let outcome = poll(
            move || async move {
                watched.iter().all(|m| m.state() == NodeState::ReadyToProvision)
                    || watched.iter().any(|m| m.state() == NodeState::Failed)
            },
            self.timing.interval,
            self.timing.deadline,
        )
        .await;

        if outcome == PollOutcome::TimedOut {
            return Err(EngineError::ReachabilityTimeout(self.unready_nodes()));
        }
        if let Some(failed) = machines.iter().find(|m| m.state() == NodeState::Failed) {
            // Escalate the node's own failure so the error kind survives
            // to the retry decision.
            return Err(failed.take_failure().unwrap_or_else(|| {
                ProviderError::CreateNode(format!(
                    "node {:?} failed during creation",
                    failed.name()
                ))
                .into()
            }));
        }

        // Record assigned addresses on the nodes; the balancer attribute
        // templates bind them as `node_ip`.
        let addresses: Vec<(String, String)> = self
            .machines
            .iter()
            .filter_map(|(name, m)| m.address().map(|a| (name.clone(), a)))
            .collect();
        for (name, address) in addresses {
            if let Some(node) = self.system.node_mut(&name) {
                node.options.insert("node_ip".to_string(), json!(address));
            }
        }
        Ok(())
    }

    /// Create each declared balancer, wait for it to become active, and
    /// merge balancer-derived attributes into the nodes.
    async fn load_balance(&mut self) -> EngineResult<()> {
        let specs = self.system.load_balancers.clone();
        if specs.is_empty() {
            debug!(system = %self.tag, "no load balancers declared");
            return Ok(());
        }
        let balancer = self.collab.balancer.clone().ok_or_else(|| RegistryError {
            kind: "load balancer",
            name: self
                .settings
                .load_balancer_provider
                .clone()
                .unwrap_or_else(|| "unset".to_string()),
        })?;

        for spec in &specs {
            info!(system = %self.tag, balancer = %spec.name, "creating load balancer");
            let members: Vec<Node> = self
                .system
                .members_of_role(&spec.role)
                .into_iter()
                .cloned()
                .collect();
            balancer.create_lb(spec, &members, &spec.vips).await?;

            let watched = &*balancer;
            let name = spec.name.as_str();
            let outcome = poll(
                move || async move {
                    matches!(watched.status(name).await, Ok(BalancerStatus::Active))
                },
                self.timing.interval,
                self.timing.deadline,
            )
            .await;
            if outcome == PollOutcome::TimedOut {
                return Err(ProviderError::Balancer(format!(
                    "balancer {:?} never became active",
                    spec.name
                ))
                .into());
            }

            if let Some(template) = &spec.attributes_template {
                let lb_ip = balancer.lb_ip(&spec.name).await?;
                // Only the balancer's member nodes receive its attributes.
                for member in &members {
                    let Some(node) = self.system.node_mut(&member.name) else {
                        continue;
                    };
                    let mut bindings = Bindings::new();
                    bindings.insert("lb_ip".to_string(), lb_ip.clone());
                    bindings.insert("node_name".to_string(), node.name.clone());
                    if let Some(ip) = node.opt("node_ip").and_then(Value::as_str) {
                        bindings.insert("node_ip".to_string(), ip.to_string());
                    }
                    let rendered = template::render(template, &bindings);
                    node.merge_attributes(&rendered);
                    debug!(node = %node.name, "merged balancer attributes");
                }
            }

            if spec.register_dns {
                let domain = ambient_str("domain", None, &self.system, &self.settings);
                match (&self.collab.dns, domain) {
                    (Some(dns), Some(domain)) => {
                        let tag = ambient_str("tag", None, &self.system, &self.settings);
                        balancer
                            .setup_dns(dns.as_ref(), &spec.name, &domain, tag.as_deref())
                            .await?;
                    }
                    _ => debug!(
                        balancer = %spec.name,
                        "no dns provider or domain configured, skipping registration"
                    ),
                }
            }

            if let Some(ssl) = &spec.ssl {
                balancer
                    .set_ssl_termination(&spec.name, ssl.port, &ssl.key, &ssl.cert, &ssl.options)
                    .await?;
            }
        }
        Ok(())
    }

    /// Rebalance weights, then provision every node once its parents
    /// complete. Independent branches proceed concurrently; the
    /// transition waits for the completion tally or the deadline.
    async fn provision(&mut self) -> EngineResult<()> {
        info!(system = %self.tag, "provisioning system");
        self.system.rebalance()?;
        let domain = ambient_str("domain", None, &self.system, &self.settings);

        let total = self.system.len();
        for node in self.system.nodes() {
            let Some(machine) = self.machines.get(&node.name).cloned() else {
                continue;
            };
            let parents: Vec<Arc<NodeProvisioner>> = node
                .parents
                .iter()
                .filter_map(|p| self.machines.get(p).cloned())
                .collect();
            let payload = node.configuration_payload(domain.as_deref());
            let timing = self.timing;

            tokio::spawn(async move {
                let watched = &parents;
                let outcome = poll(
                    move || async move {
                        watched.iter().all(|p| p.state() == NodeState::Complete)
                            || watched.iter().any(|p| p.state() == NodeState::Failed)
                    },
                    timing.interval,
                    timing.deadline,
                )
                .await;

                let parents_complete =
                    parents.iter().all(|p| p.state() == NodeState::Complete);
                if outcome == PollOutcome::Ready && parents_complete {
                    if let Err(e) = machine.begin_provision(payload).await {
                        warn!(node = %machine.name(), error = %e, "node provisioning failed");
                        machine.fail_with(e);
                    }
                } else if outcome == PollOutcome::TimedOut {
                    warn!(node = %machine.name(), "dependencies never completed, skipping provision");
                    machine.fail_with(EngineError::ParentWaitTimeout(format!(
                        "node {:?}",
                        machine.name()
                    )));
                } else {
                    // A parent failed; its own recorded error escalates.
                    warn!(node = %machine.name(), "dependency failed, skipping provision");
                    machine.mark_failed();
                }
            });
        }

        let machines: Vec<Arc<NodeProvisioner>> = self.machines.values().cloned().collect();
        let watched = &machines;
        let tally = &*self.tally;
        let outcome = poll(
            move || async move {
                tally.count() >= total
                    || watched.iter().any(|m| m.state() == NodeState::Failed)
            },
            self.timing.interval,
            self.timing.deadline,
        )
        .await;

        if outcome == PollOutcome::TimedOut {
            return Err(EngineError::ParentWaitTimeout(self.incomplete_nodes()));
        }
        if let Some(failed) = machines.iter().find(|m| m.state() == NodeState::Failed) {
            return Err(machines
                .iter()
                .find_map(|m| m.take_failure())
                .unwrap_or_else(|| EngineError::ConfigurationApply {
                    node: failed.name().to_string(),
                    reason: "node entered the failed state".to_string(),
                }));
        }
        Ok(())
    }

    /// Post-provision hook: run the configured remote command on every
    /// node that opted in. Exhausting the command's attempt budget is a
    /// system-level failure.
    async fn system_provisioned(&self) -> EngineResult<()> {
        for node in self.system.nodes() {
            let opted = ambient_opt("post_provision", Some(node), &self.system, &self.settings)
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !opted {
                continue;
            }
            let Some(command) =
                ambient_str("post_provision_command", Some(node), &self.system, &self.settings)
            else {
                continue;
            };
            let Some(address) = self.machines.get(&node.name).and_then(|m| m.address()) else {
                continue;
            };

            let provider = &*self.collab.provider;
            let address = address.as_str();
            let command = command.as_str();
            let result = retry::with_attempts(
                retry::DEFAULT_ATTEMPTS,
                retry::DEFAULT_DELAY,
                move || async move { provider.run_command(address, command).await },
            )
            .await;
            match result {
                Ok(_) => debug!(node = %node.name, %command, "post-provision command ran"),
                Err(e) => {
                    error!(node = %node.name, error = %e, "post-provision command failed");
                    return Err(e.into());
                }
            }
        }
        info!(system = %self.tag, time_used = ?self.time_used, "system provisioned");
        Ok(())
    }

    /// The single error-handling decision: retry the whole system, or
    /// halt once the failure bound is exceeded.
    async fn error_handler(&mut self) -> SystemEvent {
        self.failures += 1;
        if self.failures > self.max_failures {
            error!(
                system = %self.tag,
                failures = self.failures,
                "system creation failed, halting"
            );
            SystemEvent::CreationHalted
        } else {
            warn!(
                system = %self.tag,
                failures = self.failures,
                max_failures = self.max_failures,
                "recoverable failure, tearing down and recreating"
            );
            self.teardown().await;
            SystemEvent::Reclaimed
        }
    }

    /// Tear down every provisioned resource for the system and drop the
    /// node machines of the aborted run.
    async fn teardown(&mut self) {
        let nodes: Vec<Node> = self.system.nodes().cloned().collect();
        if let Err(e) = self.collab.provider.kill(&nodes).await {
            error!(system = %self.tag, error = %e, "teardown failed");
        }
        self.machines.clear();
        self.tally.reset();
    }

    fn unready_nodes(&self) -> String {
        self.describe_nodes_where(|state| state != NodeState::ReadyToProvision)
    }

    fn incomplete_nodes(&self) -> String {
        self.describe_nodes_where(|state| state != NodeState::Complete)
    }

    fn describe_nodes_where(&self, pred: impl Fn(NodeState) -> bool) -> String {
        let names: Vec<&str> = self
            .machines
            .iter()
            .filter(|(_, m)| pred(m.state()))
            .map(|(name, _)| name.as_str())
            .collect();
        format!("node(s) {}", names.join(", "))
    }
}

impl std::fmt::Debug for SystemProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemProvisioner")
            .field("tag", &self.tag)
            .field("state", &self.state())
            .field("failures", &self.failures)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_accepts_the_happy_path() {
        let mut state = SystemState::Initializing;
        for event in [
            SystemEvent::Initialized,
            SystemEvent::Created,
            SystemEvent::LoadBalanced,
            SystemEvent::Provisioned,
        ] {
            state = system_transition(state, event).unwrap();
        }
        assert_eq!(state, SystemState::Complete);
    }

    #[test]
    fn error_halt_and_reclaim_are_accepted_from_any_state() {
        for state in [
            SystemState::Initializing,
            SystemState::Creating,
            SystemState::LoadBalancing,
            SystemState::Provisioning,
        ] {
            assert_eq!(
                system_transition(state, SystemEvent::ErrorOccurred).unwrap(),
                SystemState::HandlingError
            );
            assert_eq!(
                system_transition(state, SystemEvent::CreationHalted).unwrap(),
                SystemState::Failed
            );
            assert_eq!(
                system_transition(state, SystemEvent::Reclaimed).unwrap(),
                SystemState::Initializing
            );
        }
    }

    #[test]
    fn undeclared_transitions_are_rejected() {
        let err =
            system_transition(SystemState::Initializing, SystemEvent::Provisioned).unwrap_err();
        match err {
            EngineError::InvalidTransition { state, event } => {
                assert_eq!(state, "initializing");
                assert_eq!(event, "provisioned");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn completion_tally_counts_and_resets() {
        let tally = CompletionTally::default();
        assert_eq!(tally.count(), 0);
        assert_eq!(tally.record(), 1);
        assert_eq!(tally.record(), 2);
        tally.reset();
        assert_eq!(tally.count(), 0);
    }
}
