//! The in-tree reference system for the latent-physics trainer: a damped
//! linear point-mass engine with an analytic adjoint pass, a deterministic
//! linear autoencoder, and a nearest-neighbour assignment oracle.
//!
//! The engine's dynamics are deliberately simple — every derivative is
//! available in closed form — so gradient recording can be validated
//! against finite differences while still exercising the full rollout
//! protocol: reset, per-step targets, decayed loss accumulation, and
//! state/action gradient read-back.

mod dataset;
mod engine;
mod model;
mod oracle;

pub use dataset::synthetic_rollouts;
pub use engine::{SpringConfig, SpringConfigBuilder, SpringEngine};
pub use model::LinearAutoEncoder;
pub use oracle::NearestNeighbourOracle;
