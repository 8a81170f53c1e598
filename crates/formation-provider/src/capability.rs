//! The three capability interfaces consumed by the orchestration core.

use async_trait::async_trait;
use serde_json::{Map, Value};

use formation_core::{BalancerSpec, Node};

use crate::error::ProviderResult;

/// Result of a successful create-node call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedNode {
    pub name: String,
    /// Address the node will eventually be reachable at.
    pub address: String,
}

/// Observable state of a load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancerStatus {
    /// Still building; the engine polls until this clears.
    Pending,
    Active,
    Failed,
}

/// A machine provider (cloud vendor, hypervisor, or the test stub).
///
/// `create_node` is side-effecting and must eventually make the node
/// reachable; the engine polls `reachable` on a fixed interval until its
/// deadline. A firing deadline never cancels an in-flight call — cleanup
/// of partially created resources belongs to `kill`.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start creating a machine for the node, returning the address it
    /// will come up at.
    async fn create_node(&self, node: &Node) -> ProviderResult<CreatedNode>;

    /// One reachability probe against a created node.
    async fn reachable(&self, address: &str) -> bool;

    /// Apply a configuration payload to a reachable node.
    async fn apply_configuration(&self, address: &str, payload: &Value) -> ProviderResult<()>;

    /// Run a remote command against a reachable node.
    async fn run_command(&self, address: &str, command: &str) -> ProviderResult<String>;

    /// Tear down every resource belonging to the given nodes.
    async fn kill(&self, nodes: &[Node]) -> ProviderResult<()>;
}

/// A load-balancer provider.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start provisioning a balancer fronting the member nodes. The
    /// engine polls `status` until the balancer leaves `Pending`.
    async fn create_lb(
        &self,
        spec: &BalancerSpec,
        members: &[Node],
        vips: &[Value],
    ) -> ProviderResult<()>;

    async fn status(&self, name: &str) -> ProviderResult<BalancerStatus>;

    /// Virtual IP of an active balancer.
    async fn lb_ip(&self, name: &str) -> ProviderResult<String>;

    async fn set_ssl_termination(
        &self,
        name: &str,
        port: u16,
        key: &str,
        cert: &str,
        options: &Map<String, Value>,
    ) -> ProviderResult<()>;

    /// Register a DNS record for the balancer. Vendors with a native
    /// balancer/DNS coupling may override this.
    async fn setup_dns(
        &self,
        dns: &dyn DnsProvider,
        name: &str,
        domain: &str,
        tag: Option<&str>,
    ) -> ProviderResult<()> {
        let ip = self.lb_ip(name).await?;
        dns.create_entry_by_name(name, domain, &ip, tag).await?;
        Ok(())
    }
}

/// A DNS provider.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Register an A record, returning an asynchronous job handle when
    /// the vendor processes records out of band.
    async fn create_entry_by_name(
        &self,
        name: &str,
        domain: &str,
        ip: &str,
        tag: Option<&str>,
    ) -> ProviderResult<Option<String>>;

    /// Status of an asynchronous registration job.
    async fn entry_status(&self, job_id: &str) -> ProviderResult<String>;
}
