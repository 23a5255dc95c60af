//! The distributed focal-training loop for the latent-physics stack.
//!
//! Workers launched through [`collective::CommGroup`] each own a full
//! solver and dataset replica; only scalar losses, gradient buffers, and
//! parameter buffers cross rank boundaries, through the collectives. The
//! loop alternates gradient phases over the highest-loss (focal) subset
//! with evaluation phases that refresh the replicated loss table.

mod dataset;
mod train;

pub use dataset::{PointCloudDataset, Sample};
pub use train::{learn_latent, learn_latent_focal, warm_start, TrainReport};
