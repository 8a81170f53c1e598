//! A single node of a declared system.
//!
//! Nodes carry an ordered run list of opaque role/recipe tags, an ordered
//! dependency set, a free-form options map (with a nested `attributes`
//! sub-map that ends up in the generated configuration payload), and the
//! graph edges wired by [`crate::System`]. Edges are node names, not
//! ownership.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Unique name of a node within its system.
pub type NodeName = String;

/// Default multiplier applied to parent weights when deriving a node's
/// rebalancing weight.
pub const DEFAULT_PARENT_MULTIPLIER: u64 = 5;

/// One machine/role unit in a system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: NodeName,

    /// Ordered role/recipe tags describing the configuration this node
    /// receives. Tags are opaque to the orchestration core.
    #[serde(default)]
    pub run_list: Vec<String>,

    /// Ordered tags this node requires be satisfied by some other node's
    /// run list.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Free-form options. The nested `attributes` object is merged into
    /// the configuration payload at provisioning time.
    #[serde(default)]
    pub options: Map<String, Value>,

    /// Names of nodes this node depends on (wired by the system graph).
    #[serde(default)]
    pub parents: Vec<NodeName>,

    /// Names of nodes depending on this node.
    #[serde(default)]
    pub children: Vec<NodeName>,

    /// Cached rebalancing weight, recomputed by [`crate::System::rebalance`].
    #[serde(default)]
    pub weight: u64,
}

impl Node {
    /// Create a bare node with the given name.
    pub fn new(name: impl Into<NodeName>) -> Self {
        Self {
            name: name.into(),
            run_list: Vec::new(),
            dependencies: Vec::new(),
            options: Map::new(),
            parents: Vec::new(),
            children: Vec::new(),
            weight: 0,
        }
    }

    /// Whether this node depends on `other`, together with the matching
    /// tag subset.
    ///
    /// True iff any tag of `self.dependencies` appears in
    /// `other.run_list`; the returned subset preserves the order of
    /// `self.dependencies`.
    pub fn depends_on(&self, other: &Node) -> (bool, Vec<String>) {
        let matched: Vec<String> = self
            .dependencies
            .iter()
            .filter(|d| other.run_list.contains(d))
            .cloned()
            .collect();
        (!matched.is_empty(), matched)
    }

    /// The nested `attributes` sub-map of the options, if present.
    pub fn attributes(&self) -> Map<String, Value> {
        match self.options.get("attributes") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }

    /// Deep-merge `extra` into the node's `attributes` sub-map.
    ///
    /// Objects merge recursively; any other value overwrites.
    pub fn merge_attributes(&mut self, extra: &Value) {
        let attrs = self
            .options
            .entry("attributes".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        deep_merge(attrs, extra);
    }

    /// Look up an option on this node only. Ambient fallback through the
    /// system and settings lives in [`crate::config::ambient_opt`].
    pub fn opt(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }

    /// The fully qualified domain name: `name[.tag][.domain]`.
    pub fn fqdn(&self, tag: Option<&str>, domain: Option<&str>) -> String {
        let mut parts = vec![self.name.as_str()];
        parts.extend(tag);
        parts.extend(domain);
        parts.join(".")
    }

    /// The configuration payload applied to the node at provisioning
    /// time: domain, merged attributes, and the run list.
    pub fn configuration_payload(&self, domain: Option<&str>) -> Value {
        let mut payload = Map::new();
        payload.insert("domain".into(), json!(domain.unwrap_or("formation")));
        for (key, value) in self.attributes() {
            payload.insert(key, value);
        }
        payload.insert("run_list".into(), json!(self.run_list));
        Value::Object(payload)
    }

    /// Serializable description for status reporting.
    pub fn describe(&self) -> Value {
        json!({
            "name": self.name,
            "options": self.options,
            "dependencies": self.dependencies,
            "run_list": self.run_list,
        })
    }
}

/// Two nodes are graph-equal iff their dependency sets and run lists are
/// equal; name, options, and edges do not participate.
impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.dependencies == other.dependencies && self.run_list == other.run_list
    }
}

impl Eq for Node {}

fn deep_merge(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (key, value) in src_map {
                match dst_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        dst_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (dst, src) => *dst = src.clone(),
    }
}
