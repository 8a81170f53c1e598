//! Error types for the core model.

use thiserror::Error;

/// Result type alias for core model operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by graph construction and description parsing.
///
/// These are synchronous, local programmer errors: they fail the mutating
/// call immediately and never enter the provisioning retry path.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The child cannot participate in the dependency graph: it carries
    /// neither a dependency set nor a run list.
    #[error("invalid child {0:?}: a graph member must carry dependencies or a run list")]
    InvalidChild(String),

    #[error("unknown node: {0:?}")]
    UnknownNode(String),

    /// Adding the edge would close a dependency loop.
    #[error("dependency cycle: {child:?} already reaches {parent:?}")]
    DependencyCycle { parent: String, child: String },

    #[error("invalid system description: {0}")]
    Description(String),
}
