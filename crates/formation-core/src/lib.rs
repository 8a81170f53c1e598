//! Formation core — the declarative model behind a provisioning run.
//!
//! A *system* is a set of interdependent *nodes*, each carrying a run list
//! (ordered role/recipe tags) and a dependency set (tags that some other
//! node's run list must satisfy). This crate holds the structural model
//! that the provisioning engine drives:
//!
//! - **`node`** — a single machine/role unit: run list, dependencies,
//!   options, graph edges, derived weight
//! - **`system`** — the full declared deployment: name-keyed node graph,
//!   load-balancer declarations, option overrides, description parsing
//! - **`config`** — `formation.toml` settings and the ambient option
//!   lookup (node → system → settings)
//! - **`template`** — `{{var}}` substitution over JSON trees, used when
//!   balancer-derived values are merged back into node attributes

pub mod config;
pub mod error;
pub mod node;
pub mod system;
pub mod template;

pub use config::{Settings, ambient_opt, ambient_str};
pub use error::{CoreError, CoreResult};
pub use node::{DEFAULT_PARENT_MULTIPLIER, Node, NodeName};
pub use system::{BalancerSpec, SslTermination, System};
