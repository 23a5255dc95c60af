use std::path::PathBuf;

use thiserror::Error;

/// Rejected configuration. Always fatal: a bad option is a programming or
/// launch mistake, not a runtime physical condition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A loss-function name outside the closed set.
    #[error("unknown loss function `{0}` (expected chamfer, emd, state, or loss)")]
    UnknownLoss(String),
    /// An optimizer name outside the closed set.
    #[error("unknown optimizer `{0}` (expected Adam or Momentum)")]
    UnknownOptim(String),
    /// An action-initialization sampler outside the closed set.
    #[error("unknown init sampler `{0}` (expected uniform)")]
    UnknownSampler(String),
    /// A field that fails eager validation.
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// The offending configuration field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Failure raised by a rollout engine at its boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A state handed to the engine disagrees with the particle count the
    /// engine was built for. Caught eagerly: a silent mismatch would produce
    /// physical nonsense rather than an error downstream.
    #[error("state has {found} particles but the engine expects {expected}")]
    ParticleCountMismatch {
        /// The engine's configured particle count.
        expected: usize,
        /// The particle count of the offending state.
        found: usize,
    },
    /// A state whose per-particle buffers disagree in length.
    #[error("state buffers disagree on particle count")]
    InconsistentState,
    /// Snapshot persistence failed.
    #[error("failed to persist state snapshot")]
    Io(#[from] std::io::Error),
}

/// Failure raised by the rollout coordinator.
///
/// NaN gradients are deliberately absent: a divergent gradient is an
/// expected outcome of differentiating through contact-rich dynamics and is
/// reported as a `None` gradient, never as an error.
#[derive(Debug, Error)]
pub enum SolverError {
    /// The reordered decoded cloud does not match the simulator's particle
    /// count or ordering expectations.
    #[error("decoded cloud has {decoded} points but the state carries {expected} particles")]
    ShapeMismatch {
        /// The particle count of the caller's state.
        expected: usize,
        /// The point count of the decoded cloud.
        decoded: usize,
    },
    /// The action plan is shorter than the effective rollout length.
    #[error("action plan covers {available} steps but the rollout needs {needed}")]
    PlanTooShort {
        /// The effective rollout length.
        needed: usize,
        /// The number of actions supplied.
        available: usize,
    },
    /// The engine rejected the substituted state.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Failure loading or persisting model weights. Fatal at startup; no
/// fallback model is constructed.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The weight file could not be read or written.
    #[error("checkpoint I/O failed for {path}")]
    Io {
        /// The checkpoint path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The weight file exists but does not describe this model.
    #[error("checkpoint {path} is malformed: {reason}")]
    Malformed {
        /// The checkpoint path.
        path: PathBuf,
        /// What disagreed with the expected layout.
        reason: String,
    },
}
