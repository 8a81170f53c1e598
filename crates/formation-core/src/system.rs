//! A declared system: the node graph plus load-balancer declarations.
//!
//! Systems are parsed from a JSON description submitted by a front-end.
//! Parsing wires the dependency graph (`resolve_dependencies`), so a
//! freshly parsed system is ready to hand to the provisioning engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{CoreError, CoreResult};
use crate::node::{DEFAULT_PARENT_MULTIPLIER, Node, NodeName};

/// Declaration of one load balancer fronting a role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerSpec {
    pub name: String,

    /// Run-list tag selecting the member nodes.
    pub role: String,

    /// Virtual IP declarations, passed through to the balancer plugin.
    #[serde(default)]
    pub vips: Vec<Value>,

    /// Attribute template merged into member node attributes once the
    /// balancer is active. `{{lb_ip}}`, `{{node_ip}}`, and `{{node_name}}`
    /// are substituted per node.
    #[serde(default)]
    pub attributes_template: Option<Value>,

    /// Optional TLS termination at the balancer.
    #[serde(default)]
    pub ssl: Option<SslTermination>,

    /// Register a DNS record for the balancer once it is active.
    #[serde(default = "default_true")]
    pub register_dns: bool,
}

/// TLS termination parameters for a balancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslTermination {
    pub key: String,
    pub cert: String,
    #[serde(default = "default_ssl_port")]
    pub port: u16,
    #[serde(default)]
    pub options: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

fn default_ssl_port() -> u16 {
    443
}

/// Wire format of a system description.
#[derive(Debug, Deserialize)]
struct RawDescription {
    #[serde(default)]
    options: Map<String, Value>,
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    load_balancers: Vec<BalancerSpec>,
}

/// The full declared deployment: an unordered collection of nodes, the
/// load-balancer declarations, and system-level option overrides.
#[derive(Debug, Clone, Default)]
pub struct System {
    nodes: BTreeMap<NodeName, Node>,
    pub load_balancers: Vec<BalancerSpec>,
    pub options: Map<String, Value>,
}

impl System {
    /// An empty system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a system from a JSON description and wire its dependency
    /// graph.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        let raw: RawDescription = serde_json::from_value(value)
            .map_err(|e| CoreError::Description(e.to_string()))?;

        let mut system = System {
            nodes: BTreeMap::new(),
            load_balancers: raw.load_balancers,
            options: raw.options,
        };
        for node in raw.nodes {
            system.add_node(node)?;
        }
        system.resolve_dependencies()?;
        Ok(system)
    }

    /// Parse a system from a JSON string.
    pub fn from_json(text: &str) -> CoreResult<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| CoreError::Description(e.to_string()))?;
        Self::from_value(value)
    }

    /// Add a node. Names must be unique within the system.
    pub fn add_node(&mut self, mut node: Node) -> CoreResult<()> {
        if self.nodes.contains_key(&node.name) {
            return Err(CoreError::Description(format!(
                "duplicate node name {:?}",
                node.name
            )));
        }
        node.parents.clear();
        node.children.clear();
        self.nodes.insert(node.name.clone(), node);
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    pub fn node_names(&self) -> Vec<NodeName> {
        self.nodes.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes whose run list contains `role` — the member set for a
    /// balancer declaration.
    pub fn members_of_role(&self, role: &str) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|n| n.run_list.iter().any(|tag| tag == role))
            .collect()
    }

    /// Register `child` as depending on `parent`.
    ///
    /// Rejects a child carrying neither dependencies nor a run list
    /// (`InvalidChild`), rejects edges that would close a dependency
    /// loop (`DependencyCycle`), and is idempotent with respect to
    /// duplicate registration.
    pub fn add_child(&mut self, parent: &str, child: &str) -> CoreResult<()> {
        if !self.nodes.contains_key(parent) {
            return Err(CoreError::UnknownNode(parent.to_string()));
        }
        let child_node = self
            .nodes
            .get(child)
            .ok_or_else(|| CoreError::UnknownNode(child.to_string()))?;
        if child_node.dependencies.is_empty() && child_node.run_list.is_empty() {
            return Err(CoreError::InvalidChild(child.to_string()));
        }
        if self.nodes[parent].children.iter().any(|c| c == child) {
            return Ok(());
        }
        if parent == child || self.reaches(child, parent) {
            return Err(CoreError::DependencyCycle {
                parent: parent.to_string(),
                child: child.to_string(),
            });
        }

        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.push(child.to_string());
        }
        if let Some(c) = self.nodes.get_mut(child)
            && !c.parents.iter().any(|p| p == parent)
        {
            c.parents.push(parent.to_string());
        }
        Ok(())
    }

    /// Whether `target` is reachable from `start` along child edges.
    fn reaches(&self, start: &str, target: &str) -> bool {
        let mut stack = vec![start.to_string()];
        let mut seen = std::collections::BTreeSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.children.iter().cloned());
            }
        }
        false
    }

    /// Wire graph edges from dependency/run-list matches: if `a` depends
    /// on `b`, `a` becomes a child of `b`.
    pub fn resolve_dependencies(&mut self) -> CoreResult<()> {
        let names = self.node_names();
        for child in &names {
            for parent in &names {
                if child == parent {
                    continue;
                }
                let (depends, _) = self.nodes[child].depends_on(&self.nodes[parent]);
                if depends {
                    self.add_child(parent, child)?;
                }
            }
        }
        Ok(())
    }

    /// The multiplier applied to parent weights, overridable via the
    /// `parent_multiplier` system option.
    pub fn parent_multiplier(&self) -> u64 {
        self.options
            .get("parent_multiplier")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_PARENT_MULTIPLIER)
    }

    /// The dependency weight of a node: `1 + Σ weight(parent) × multiplier`.
    ///
    /// Side-effect free and safe to call repeatedly; cycle rejection at
    /// edge construction keeps the recursion total.
    pub fn weight_of(&self, name: &str) -> CoreResult<u64> {
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| CoreError::UnknownNode(name.to_string()))?;
        let multiplier = self.parent_multiplier();
        let mut weight = 1;
        for parent in &node.parents {
            weight += self.weight_of(parent)? * multiplier;
        }
        Ok(weight)
    }

    /// Recompute and cache every node's weight.
    pub fn rebalance(&mut self) -> CoreResult<()> {
        let names = self.node_names();
        for name in names {
            let weight = self.weight_of(&name)?;
            if let Some(node) = self.nodes.get_mut(&name) {
                node.weight = weight;
            }
        }
        Ok(())
    }

    /// System-level option lookup. Ambient fallback through the settings
    /// lives in [`crate::config::ambient_opt`].
    pub fn opt(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }

    /// Serializable description for status reporting.
    pub fn describe(&self) -> Value {
        json!({
            "options": self.options,
            "nodes": self.nodes.values().map(Node::describe).collect::<Vec<_>>(),
            "load_balancers": self.load_balancers,
        })
    }
}
