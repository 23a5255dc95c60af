#![forbid(
    missing_docs,
    clippy::missing_assert_message,
    clippy::missing_docs_in_private_items,
    clippy::missing_asserts_for_indexing,
    clippy::missing_panics_doc
)]
//! This crate defines the common types, interfaces, and configuration for the
//! latent-physics training project: a point-cloud autoencoder whose latent
//! code is optimized jointly with a differentiable particle simulator.

/// Defines the interfaces accessible to different components of the training
/// system:
/// - Rollout Engine: advances a particle state step-by-step under an action
///   sequence, optionally recording gradients of the accumulated loss.
/// - Assignment Oracle: computes a one-to-one correspondence between a
///   decoded point cloud and a ground-truth point cloud.
/// - Latent Model: encodes a raw point cloud to a latent code and decodes it
///   back to a full particle set.
pub mod interfaces;

/// Defines the immutable, eagerly validated configuration structs and the
/// closed enumerations for loss functions, optimizers, and action samplers.
pub mod config;

/// Defines the error taxonomy for configuration, solver, engine, and
/// checkpoint failures.
pub mod error;

/// Defines the particle-state value types exchanged between the dataset, the
/// rollout coordinator, and the simulator.
pub mod state;

/// Defines a useful [`Copy`] and [`bytemuck::Pod`]-implementing
/// [`Vector<T, const DIMS: usize>`](crate::vector::Vector) that wraps the array type.
pub mod vector;

/// Defines the [`Rope<T>`](crate::rope::Rope) and
/// [`RopeMut<T>`](crate::rope::RopeMut) types that present non-contiguous
/// parameter and gradient buffers as one logical vector.
pub mod rope;

/// This trait defines the set of floats that have nice computer properties.
pub trait Float: num::Float + bytemuck::Pod + Send + Sync + Default {}

impl Float for f32 {}
impl Float for f64 {}
