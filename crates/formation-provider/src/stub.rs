//! In-memory stub plugins.
//!
//! These back the engine's test suite and double as the default plugin
//! registrations: every capability call is recorded, and failure knobs
//! let tests steer a provisioning run into any error path without real
//! infrastructure.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use formation_core::{BalancerSpec, Node};

use crate::capability::{BalancerStatus, CreatedNode, DnsProvider, LoadBalancer, Provider};
use crate::error::{ProviderError, ProviderResult};

// ── Provider stub ──────────────────────────────────────────────────

#[derive(Debug, Default)]
struct StubProviderState {
    /// Node name → assigned address, in creation order.
    addresses: HashMap<String, String>,
    /// Address → node name, for reverse lookups on apply/command calls.
    names: HashMap<String, String>,
    created: Vec<String>,
    applied: Vec<String>,
    commands: Vec<(String, String)>,
    killed: Vec<Vec<String>>,
    probe_counts: HashMap<String, u32>,

    fail_create: HashSet<String>,
    unreachable: HashSet<String>,
    reachable_after: HashMap<String, u32>,
    fail_apply: HashSet<String>,
    hold_apply: HashSet<String>,
    fail_command: bool,
}

/// An in-memory provider with failure knobs and a call log.
#[derive(Debug, Default)]
pub struct StubProvider {
    state: Mutex<StubProviderState>,
}

impl StubProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `create_node` fail for the named node.
    pub fn fail_create(&self, node: &str) {
        self.state.lock().unwrap().fail_create.insert(node.into());
    }

    /// Make the named node never pass a reachability probe.
    pub fn set_unreachable(&self, node: &str) {
        self.state.lock().unwrap().unreachable.insert(node.into());
    }

    /// Make the named node reachable only from the `probes`-th probe on.
    pub fn reachable_after(&self, node: &str, probes: u32) {
        self.state
            .lock()
            .unwrap()
            .reachable_after
            .insert(node.into(), probes);
    }

    /// Make `apply_configuration` fail for the named node.
    pub fn fail_apply(&self, node: &str) {
        self.state.lock().unwrap().fail_apply.insert(node.into());
    }

    /// Make `apply_configuration` hang forever for the named node.
    pub fn hold_apply(&self, node: &str) {
        self.state.lock().unwrap().hold_apply.insert(node.into());
    }

    /// Make every `run_command` call fail.
    pub fn fail_commands(&self) {
        self.state.lock().unwrap().fail_command = true;
    }

    /// Node names in creation order.
    pub fn created(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    /// Node names in configuration-apply order.
    pub fn apply_order(&self) -> Vec<String> {
        self.state.lock().unwrap().applied.clone()
    }

    /// Remote commands run, as (node, command) pairs.
    pub fn commands(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Number of teardown calls.
    pub fn kill_count(&self) -> usize {
        self.state.lock().unwrap().killed.len()
    }

    /// Node-name sets passed to each teardown call.
    pub fn killed(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().killed.clone()
    }

    fn name_for(&self, address: &str) -> Option<String> {
        self.state.lock().unwrap().names.get(address).cloned()
    }
}

#[async_trait]
impl Provider for StubProvider {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn create_node(&self, node: &Node) -> ProviderResult<CreatedNode> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create.contains(&node.name) {
            return Err(ProviderError::CreateNode(format!(
                "stub refuses to create {:?}",
                node.name
            )));
        }
        let address = format!("10.0.0.{}", state.created.len() + 1);
        state.created.push(node.name.clone());
        state.addresses.insert(node.name.clone(), address.clone());
        state.names.insert(address.clone(), node.name.clone());
        debug!(node = %node.name, %address, "stub created node");
        Ok(CreatedNode {
            name: node.name.clone(),
            address,
        })
    }

    async fn reachable(&self, address: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(name) = state.names.get(address).cloned() else {
            return false;
        };
        if state.unreachable.contains(&name) {
            return false;
        }
        let probes = {
            let count = state.probe_counts.entry(name.clone()).or_insert(0);
            *count += 1;
            *count
        };
        match state.reachable_after.get(&name) {
            Some(threshold) => probes >= *threshold,
            None => true,
        }
    }

    async fn apply_configuration(&self, address: &str, _payload: &Value) -> ProviderResult<()> {
        let name = self
            .name_for(address)
            .ok_or_else(|| ProviderError::ApplyConfiguration(format!("unknown address {address}")))?;
        let held = self.state.lock().unwrap().hold_apply.contains(&name);
        if held {
            std::future::pending::<()>().await;
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_apply.contains(&name) {
            return Err(ProviderError::ApplyConfiguration(format!(
                "stub refuses to configure {name:?}"
            )));
        }
        state.applied.push(name);
        Ok(())
    }

    async fn run_command(&self, address: &str, command: &str) -> ProviderResult<String> {
        let name = self
            .name_for(address)
            .ok_or_else(|| ProviderError::Command(format!("unknown address {address}")))?;
        let mut state = self.state.lock().unwrap();
        if state.fail_command {
            return Err(ProviderError::Command(format!(
                "stub refuses to run {command:?} on {name:?}"
            )));
        }
        state.commands.push((name, command.to_string()));
        Ok(String::new())
    }

    async fn kill(&self, nodes: &[Node]) -> ProviderResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .killed
            .push(nodes.iter().map(|n| n.name.clone()).collect());
        // A teardown invalidates previously assigned addresses.
        state.addresses.clear();
        state.names.clear();
        state.probe_counts.clear();
        Ok(())
    }
}

// ── Load-balancer stub ─────────────────────────────────────────────

#[derive(Debug, Default)]
struct StubBalancerState {
    created: Vec<String>,
    members: HashMap<String, Vec<String>>,
    ips: HashMap<String, String>,
    status_polls: HashMap<String, u32>,
    ssl: Vec<(String, u16)>,
    dns_setups: Vec<(String, String)>,
    activation_polls: u32,
    failed: HashSet<String>,
}

/// An in-memory load balancer that becomes active after a configurable
/// number of status polls.
#[derive(Debug, Default)]
pub struct StubBalancer {
    state: Mutex<StubBalancerState>,
}

impl StubBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `polls` status polls before a balancer reports active.
    pub fn activate_after(&self, polls: u32) {
        self.state.lock().unwrap().activation_polls = polls;
    }

    /// Make the named balancer report a failed state.
    pub fn fail(&self, name: &str) {
        self.state.lock().unwrap().failed.insert(name.into());
    }

    pub fn created(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn members_of(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .members
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn ssl_terminations(&self) -> Vec<(String, u16)> {
        self.state.lock().unwrap().ssl.clone()
    }

    pub fn dns_setups(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().dns_setups.clone()
    }
}

#[async_trait]
impl LoadBalancer for StubBalancer {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn create_lb(
        &self,
        spec: &BalancerSpec,
        members: &[Node],
        _vips: &[Value],
    ) -> ProviderResult<()> {
        let mut state = self.state.lock().unwrap();
        let ip = format!("192.0.2.{}", state.created.len() + 10);
        state.created.push(spec.name.clone());
        state
            .members
            .insert(spec.name.clone(), members.iter().map(|n| n.name.clone()).collect());
        state.ips.insert(spec.name.clone(), ip);
        Ok(())
    }

    async fn status(&self, name: &str) -> ProviderResult<BalancerStatus> {
        let mut state = self.state.lock().unwrap();
        if state.failed.contains(name) {
            return Ok(BalancerStatus::Failed);
        }
        if !state.ips.contains_key(name) {
            return Err(ProviderError::Balancer(format!("unknown balancer {name:?}")));
        }
        let polls = state.status_polls.entry(name.to_string()).or_insert(0);
        *polls += 1;
        if *polls > state.activation_polls {
            Ok(BalancerStatus::Active)
        } else {
            Ok(BalancerStatus::Pending)
        }
    }

    async fn lb_ip(&self, name: &str) -> ProviderResult<String> {
        self.state
            .lock()
            .unwrap()
            .ips
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::Balancer(format!("unknown balancer {name:?}")))
    }

    async fn set_ssl_termination(
        &self,
        name: &str,
        port: u16,
        _key: &str,
        _cert: &str,
        _options: &Map<String, Value>,
    ) -> ProviderResult<()> {
        self.state
            .lock()
            .unwrap()
            .ssl
            .push((name.to_string(), port));
        Ok(())
    }

    async fn setup_dns(
        &self,
        dns: &dyn DnsProvider,
        name: &str,
        domain: &str,
        tag: Option<&str>,
    ) -> ProviderResult<()> {
        let ip = self.lb_ip(name).await?;
        dns.create_entry_by_name(name, domain, &ip, tag).await?;
        self.state
            .lock()
            .unwrap()
            .dns_setups
            .push((name.to_string(), domain.to_string()));
        Ok(())
    }
}

// ── DNS stub ───────────────────────────────────────────────────────

/// A registered DNS record, as seen by the stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsEntry {
    pub name: String,
    pub domain: String,
    pub ip: String,
    pub tag: Option<String>,
}

/// An in-memory DNS provider recording every registration.
#[derive(Debug, Default)]
pub struct StubDns {
    entries: Mutex<Vec<DnsEntry>>,
}

impl StubDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DnsEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl DnsProvider for StubDns {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn create_entry_by_name(
        &self,
        name: &str,
        domain: &str,
        ip: &str,
        tag: Option<&str>,
    ) -> ProviderResult<Option<String>> {
        let mut entries = self.entries.lock().unwrap();
        entries.push(DnsEntry {
            name: name.to_string(),
            domain: domain.to_string(),
            ip: ip.to_string(),
            tag: tag.map(str::to_string),
        });
        Ok(Some(format!("job-{}", entries.len())))
    }

    async fn entry_status(&self, _job_id: &str) -> ProviderResult<String> {
        Ok("COMPLETED".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(name: &str) -> Node {
        let mut node = Node::new(name);
        node.run_list.push("role[test]".into());
        node
    }

    #[tokio::test]
    async fn provider_records_creation_and_apply_order() {
        let provider = StubProvider::new();
        let a = provider.create_node(&node("a")).await.unwrap();
        let b = provider.create_node(&node("b")).await.unwrap();
        assert_ne!(a.address, b.address);

        provider
            .apply_configuration(&b.address, &json!({}))
            .await
            .unwrap();
        provider
            .apply_configuration(&a.address, &json!({}))
            .await
            .unwrap();

        assert_eq!(provider.created(), vec!["a", "b"]);
        assert_eq!(provider.apply_order(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn provider_reachability_knobs() {
        let provider = StubProvider::new();
        provider.set_unreachable("dark");
        provider.reachable_after("slow", 3);

        let dark = provider.create_node(&node("dark")).await.unwrap();
        let slow = provider.create_node(&node("slow")).await.unwrap();
        let fast = provider.create_node(&node("fast")).await.unwrap();

        assert!(!provider.reachable(&dark.address).await);
        assert!(provider.reachable(&fast.address).await);

        assert!(!provider.reachable(&slow.address).await);
        assert!(!provider.reachable(&slow.address).await);
        assert!(provider.reachable(&slow.address).await);
    }

    #[tokio::test]
    async fn balancer_activates_after_configured_polls() {
        let balancer = StubBalancer::new();
        balancer.activate_after(2);

        let spec: BalancerSpec = serde_json::from_value(json!({
            "name": "front", "role": "role[web]"
        }))
        .unwrap();
        balancer.create_lb(&spec, &[node("web1")], &[]).await.unwrap();

        assert_eq!(balancer.status("front").await.unwrap(), BalancerStatus::Pending);
        assert_eq!(balancer.status("front").await.unwrap(), BalancerStatus::Pending);
        assert_eq!(balancer.status("front").await.unwrap(), BalancerStatus::Active);
        assert_eq!(balancer.members_of("front"), vec!["web1"]);
    }

    #[tokio::test]
    async fn default_setup_dns_registers_the_balancer_ip() {
        let balancer = StubBalancer::new();
        let dns = StubDns::new();

        let spec: BalancerSpec =
            serde_json::from_value(json!({"name": "front", "role": "role[web]"})).unwrap();
        balancer.create_lb(&spec, &[], &[]).await.unwrap();
        balancer
            .setup_dns(&dns, "front", "example.com", Some("prod"))
            .await
            .unwrap();

        let entries = dns.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "front");
        assert_eq!(entries[0].domain, "example.com");
        assert_eq!(entries[0].ip, "192.0.2.10");
        assert_eq!(entries[0].tag.as_deref(), Some("prod"));
    }
}
