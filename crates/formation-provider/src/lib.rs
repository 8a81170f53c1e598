//! Formation capability interfaces.
//!
//! The orchestration core never talks to infrastructure directly; it
//! consumes three narrow capability interfaces, each implemented by
//! interchangeable plugins resolved by name:
//!
//! - **[`Provider`]** — creates machines, checks reachability, applies
//!   configuration, runs remote commands, tears resources down
//! - **[`LoadBalancer`]** — provisions balancers and reports their state
//! - **[`DnsProvider`]** — registers DNS records
//!
//! Plugin resolution goes through a [`Registry`] mapping a name to a
//! factory; a missing name is an explicit error, never a silent fallback.
//! The in-memory [`stub`] plugins back tests and serve as the default
//! registration.

pub mod capability;
pub mod error;
pub mod registry;
pub mod retry;
pub mod stub;

pub use capability::{BalancerStatus, CreatedNode, DnsProvider, LoadBalancer, Provider};
pub use error::{ProviderError, ProviderResult, RegistryError};
pub use registry::{Registry, builtin_balancers, builtin_dns, builtin_providers};
pub use retry::with_attempts;
pub use stub::{DnsEntry, StubBalancer, StubDns, StubProvider};
