//! Per-node provisioning state machine.
//!
//! Each node walks `initializing → creating → booting →
//! ready_to_provision → provisioning → complete`; any failure detours
//! through `handling_error` into the terminal `failed` state. The machine
//! never retries locally — failures are reported upward through the
//! observable state, and the system machine owns the single retry
//! decision.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, info, trace};

use formation_core::Node;
use formation_provider::Provider;

use crate::error::{EngineError, EngineResult};
use crate::poll::{PollOutcome, PollTiming, poll};
use crate::system::CompletionTally;

/// Lifecycle state of a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Initializing,
    Creating,
    Booting,
    ReadyToProvision,
    Provisioning,
    Complete,
    HandlingError,
    Failed,
}

impl NodeState {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Initializing => "initializing",
            NodeState::Creating => "creating",
            NodeState::Booting => "booting",
            NodeState::ReadyToProvision => "ready_to_provision",
            NodeState::Provisioning => "provisioning",
            NodeState::Complete => "complete",
            NodeState::HandlingError => "handling_error",
            NodeState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events accepted by the node machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    Initialized,
    Created,
    Booted,
    Provision,
    Provisioned,
    ErrorOccurred,
    ErrorHandled,
}

impl NodeEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeEvent::Initialized => "initialized",
            NodeEvent::Created => "created",
            NodeEvent::Booted => "booted",
            NodeEvent::Provision => "provision",
            NodeEvent::Provisioned => "provisioned",
            NodeEvent::ErrorOccurred => "error_occurred",
            NodeEvent::ErrorHandled => "error_handled",
        }
    }
}

/// The declared transition table. Undeclared (state, event) pairs are
/// explicit errors, never silent no-ops.
pub fn node_transition(state: NodeState, event: NodeEvent) -> EngineResult<NodeState> {
    use NodeEvent as E;
    use NodeState as S;

    let next = match (state, event) {
        (S::Initializing, E::Initialized) => S::Creating,
        (S::Creating, E::Created) => S::Booting,
        (S::Booting, E::Booted) => S::ReadyToProvision,
        (S::ReadyToProvision, E::Provision) => S::Provisioning,
        (S::Provisioning, E::Provisioned) => S::Complete,
        (_, E::ErrorOccurred) => S::HandlingError,
        (S::HandlingError, E::ErrorHandled) => S::Failed,
        (state, event) => {
            return Err(EngineError::InvalidTransition {
                state: state.as_str(),
                event: event.as_str(),
            });
        }
    };
    Ok(next)
}

/// Drives one node through its provisioning lifecycle.
///
/// Created at the system machine's `creating` transition and dropped
/// with the provisioning run. The snapshot `state()` is the sole
/// coordination signal the system machine polls.
pub struct NodeProvisioner {
    node: Node,
    provider: Arc<dyn Provider>,
    timing: PollTiming,
    state: Mutex<NodeState>,
    address: Mutex<Option<String>>,
    failure: Mutex<Option<EngineError>>,
    tally: Arc<CompletionTally>,
}

impl NodeProvisioner {
    pub fn new(
        node: Node,
        provider: Arc<dyn Provider>,
        timing: PollTiming,
        tally: Arc<CompletionTally>,
    ) -> Self {
        Self {
            node,
            provider,
            timing,
            state: Mutex::new(NodeState::Initializing),
            address: Mutex::new(None),
            failure: Mutex::new(None),
            tally,
        }
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Observable state snapshot.
    pub fn state(&self) -> NodeState {
        *self.state.lock().unwrap()
    }

    /// Address assigned by the provider, once created.
    pub fn address(&self) -> Option<String> {
        self.address.lock().unwrap().clone()
    }

    fn fire(&self, event: NodeEvent) -> EngineResult<NodeState> {
        let mut state = self.state.lock().unwrap();
        let next = node_transition(*state, event)?;
        trace!(node = %self.node.name, from = %state, to = %next, "node transition");
        *state = next;
        Ok(next)
    }

    /// Create the node and wait for it to become reachable.
    ///
    /// Fired once by the system machine. Issues the create-node call,
    /// then probes reachability on the poll interval until the deadline.
    pub async fn initialized(&self) -> EngineResult<()> {
        self.fire(NodeEvent::Initialized)?;
        let created = self.provider.create_node(&self.node).await?;
        *self.address.lock().unwrap() = Some(created.address.clone());
        self.fire(NodeEvent::Created)?;
        info!(node = %self.node.name, address = %created.address, "node created, waiting for reachability");

        let address = created.address.as_str();
        let outcome = poll(
            move || async move { self.provider.reachable(address).await },
            self.timing.interval,
            self.timing.deadline,
        )
        .await;
        match outcome {
            PollOutcome::Ready => {
                self.fire(NodeEvent::Booted)?;
                info!(node = %self.node.name, "node ready to provision");
                Ok(())
            }
            PollOutcome::TimedOut => Err(EngineError::ReachabilityTimeout(format!(
                "node {:?}",
                self.node.name
            ))),
        }
    }

    /// Apply the configuration payload and report completion.
    ///
    /// Fired only once every parent node reports `complete`. Success
    /// increments the system's completed-node tally; failure escalates
    /// without any local retry.
    pub async fn begin_provision(&self, payload: Value) -> EngineResult<()> {
        self.fire(NodeEvent::Provision)?;
        let address = self.address().ok_or_else(|| EngineError::ConfigurationApply {
            node: self.node.name.clone(),
            reason: "no address recorded for node".to_string(),
        })?;

        match self.provider.apply_configuration(&address, &payload).await {
            Ok(()) => {
                self.fire(NodeEvent::Provisioned)?;
                let completed = self.tally.record();
                debug!(node = %self.node.name, completed, "node provisioned");
                Ok(())
            }
            Err(e) => Err(EngineError::ConfigurationApply {
                node: self.node.name.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Move the node into the terminal failed state.
    pub fn mark_failed(&self) {
        if self.fire(NodeEvent::ErrorOccurred).is_ok() {
            let _ = self.fire(NodeEvent::ErrorHandled);
        }
        debug!(node = %self.node.name, "node marked failed");
    }

    /// Record the error behind a failure and move to the terminal
    /// failed state; the system machine escalates the recorded error.
    pub fn fail_with(&self, error: EngineError) {
        *self.failure.lock().unwrap() = Some(error);
        self.mark_failed();
    }

    /// Take the recorded failure, if any.
    pub fn take_failure(&self) -> Option<EngineError> {
        self.failure.lock().unwrap().take()
    }
}

impl std::fmt::Debug for NodeProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeProvisioner")
            .field("node", &self.node.name)
            .field("state", &self.state())
            .finish()
    }
}
