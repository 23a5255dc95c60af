use std::path::Path;

use collective::CommContext;
use color_eyre::eyre::Result;
use common::config::TrainConfig;
use common::interfaces::{AssignmentOracle, LatentModel, RolloutEngine};
use common::Float;
use solver::Solver;

use crate::dataset::PointCloudDataset;

/// The outcome of one training run, identical on every rank.
#[derive(Debug, Clone)]
pub struct TrainReport<T> {
    /// Mean usable-batch loss per epoch, averaged across ranks.
    pub epoch_losses: Vec<T>,
    /// Mean of the epoch losses.
    pub final_loss: T,
}

/// Loads pretrained weights into `model` when a checkpoint exists at
/// `path`, returning whether anything was loaded. A present but malformed
/// checkpoint is fatal; no fallback model is constructed.
pub fn warm_start<T, M>(model: &mut M, path: &Path) -> Result<bool>
where
    T: Float,
    M: LatentModel<T>,
{
    if !path.is_file() {
        return Ok(false);
    }

    model.load(path)?;
    log::info!("warm-started model from {path:?}");
    Ok(true)
}

/// Overwrites every rank's parameters with the root rank's, so training
/// starts from one replica regardless of how each worker seeded its model.
fn sync_initial_params<T, M>(ctx: &CommContext, model: &mut M)
where
    T: Float + 'static,
    M: LatentModel<T>,
{
    let mut params = model.parameter_rope_mut().to_vec();
    ctx.broadcast_slice(&mut params, 0);
    model.parameter_rope_mut().copy_from_slice(&params);
}

/// Runs one gradient batch: rollout, loss-table record, collective
/// monitoring average, and one synchronized model update.
///
/// Returns the local loss when the rollout produced a usable gradient.
/// A rank with no sample (or a NaN-gated gradient) still participates in
/// every collective, contributing zero weight and a zero gradient.
fn gradient_batch<T, E, M, O>(
    ctx: &CommContext,
    solver: &mut Solver<T, E, M, O>,
    dataset: &mut PointCloudDataset<T>,
    assigned: Option<usize>,
) -> Result<Option<T>>
where
    T: Float + 'static,
    E: RolloutEngine<T>,
    M: LatentModel<T>,
    O: AssignmentOracle<T>,
{
    let outcome = match assigned {
        Some(index) => {
            let sample = dataset.get(index);
            let rollout = solver.solve_multistep(&sample.state, &sample.actions, &sample.targets)?;
            Some((index, rollout))
        }
        None => None,
    };

    let (usable_loss, gradient) = match outcome {
        Some((index, rollout)) => {
            dataset.record_loss(index, rollout.loss);
            match rollout.gradient {
                Some(gradient) => (Some(rollout.loss), Some(gradient)),
                None => (None, None),
            }
        }
        None => (None, None),
    };

    let batch_avg = match usable_loss {
        Some(loss) => ctx.avg_weighted(loss, T::one()),
        None => ctx.avg_weighted(T::zero(), T::zero()),
    };
    if ctx.is_root() {
        log::debug!("gradient batch: mean loss {:?}", batch_avg.to_f64());
    }

    let model = solver.model_mut();
    model.zero_grad();
    if let Some(gradient) = &gradient {
        model.backward(gradient);
    }
    let mut grads = model.gradient_rope_mut().to_vec();
    ctx.avg_slice(&mut grads);
    model.gradient_rope_mut().copy_from_slice(&grads);
    model.step();

    Ok(usable_loss)
}

/// Runs one evaluation batch: a gradient-free rollout that refreshes the
/// loss table. Returns the local loss when a sample was assigned.
fn eval_batch<T, E, M, O>(
    ctx: &CommContext,
    solver: &mut Solver<T, E, M, O>,
    dataset: &mut PointCloudDataset<T>,
    assigned: Option<usize>,
) -> Result<Option<T>>
where
    T: Float + 'static,
    E: RolloutEngine<T>,
    M: LatentModel<T>,
    O: AssignmentOracle<T>,
{
    let record = match assigned {
        Some(index) => {
            let sample = dataset.get(index);
            let (_first, loss) = solver.exec_multistep(&sample.state, &sample.actions, &sample.targets)?;
            Some((index, loss))
        }
        None => None,
    };

    match record {
        Some((index, loss)) => {
            dataset.record_loss(index, loss);
            ctx.avg_weighted(loss, T::one());
            Ok(Some(loss))
        }
        None => {
            ctx.avg_weighted(T::zero(), T::zero());
            Ok(None)
        }
    }
}

/// Folds local per-batch losses into one global epoch mean, weighting each
/// rank by how many of its batches contributed.
fn epoch_mean<T: Float + 'static>(ctx: &CommContext, acc: T, efficient: usize) -> T {
    let weight = num::cast::<usize, T>(efficient).expect("batch count fits in the float type");
    let local_mean = if efficient > 0 { acc / weight } else { T::zero() };

    ctx.avg_weighted(local_mean, weight)
}

/// Saves the full model and the encoder alone under the run's weight
/// directory, on the root rank only. All ranks rendezvous around the write.
fn save_checkpoints<T, E, M, O>(
    ctx: &CommContext,
    solver: &Solver<T, E, M, O>,
    cfg: &TrainConfig<T>,
    tag: &str,
) -> Result<()>
where
    T: Float + 'static,
    E: RolloutEngine<T>,
    M: LatentModel<T>,
    O: AssignmentOracle<T>,
{
    ctx.barrier();
    if ctx.is_root() {
        std::fs::create_dir_all(&cfg.pretrained_dir)?;
        solver
            .model()
            .save(&cfg.pretrained_dir.join(format!("{tag}_model.pth")))?;
        solver
            .model()
            .save_encoder(&cfg.pretrained_dir.join(format!("{tag}_encoder.pth")))?;
        log::info!("saved checkpoint pair {tag} to {:?}", cfg.pretrained_dir);
    }
    ctx.barrier();

    Ok(())
}

/// Focal training: epochs alternate between gradient phases over the
/// highest-loss subset and evaluation phases that refresh the full loss
/// table. The phase machine advances at the end of each epoch: every fifth
/// epoch resynchronizes the table and rebuilds the focal subset, and the
/// fourth epoch after that falls back to evaluation.
pub fn learn_latent_focal<T, E, M, O>(
    ctx: &CommContext,
    solver: &mut Solver<T, E, M, O>,
    dataset: &mut PointCloudDataset<T>,
    cfg: &TrainConfig<T>,
) -> Result<TrainReport<T>>
where
    T: Float + 'static,
    E: RolloutEngine<T>,
    M: LatentModel<T>,
    O: AssignmentOracle<T>,
{
    sync_initial_params(ctx, solver.model_mut());

    let world = ctx.world_size();
    let mut use_grad = false;
    let mut focal: Vec<usize> = (0..dataset.len()).collect();
    let mut epoch_losses = Vec::with_capacity(cfg.epochs);

    for epoch in 0..cfg.epochs {
        let indices: Vec<usize> = if use_grad {
            focal.clone()
        } else {
            (0..dataset.len()).collect()
        };

        let mut acc = T::zero();
        let mut efficient = 0usize;

        for chunk in indices.chunks(world) {
            let assigned = chunk.get(ctx.rank()).copied();
            let contributed = if use_grad {
                gradient_batch(ctx, solver, dataset, assigned)?
            } else {
                eval_batch(ctx, solver, dataset, assigned)?
            };
            if let Some(loss) = contributed {
                acc = acc + loss;
                efficient += 1;
            }
        }

        let epoch_loss = epoch_mean(ctx, acc, efficient);
        epoch_losses.push(epoch_loss);
        if ctx.is_root() {
            log::info!(
                "epoch {epoch} ({}): mean loss {:?}",
                if use_grad { "gradient" } else { "eval" },
                epoch_loss.to_f64()
            );
        }

        if epoch % 5 == 0 {
            dataset.sync_losses(ctx);
            focal = dataset.focal_subset(cfg.focal_size);
            use_grad = true;
        } else if epoch % 5 == 4 {
            use_grad = false;
        }
    }

    let count = num::cast::<usize, T>(epoch_losses.len().max(1))
        .expect("epoch count fits in the float type");
    let final_loss = epoch_losses.iter().fold(T::zero(), |a, &b| a + b) / count;

    save_checkpoints(ctx, solver, cfg, &cfg.exp_name)?;

    Ok(TrainReport {
        epoch_losses,
        final_loss,
    })
}

/// Plain latent training: every epoch is a gradient phase over the full
/// dataset, with early checkpoint pairs written once the global batch
/// counter passes 5, 10, and 1000 so long runs can be inspected while
/// still in flight. The counter is checked before each batch, so the
/// pair tagged `_5` is written going into the sixth batch.
pub fn learn_latent<T, E, M, O>(
    ctx: &CommContext,
    solver: &mut Solver<T, E, M, O>,
    dataset: &mut PointCloudDataset<T>,
    cfg: &TrainConfig<T>,
) -> Result<TrainReport<T>>
where
    T: Float + 'static,
    E: RolloutEngine<T>,
    M: LatentModel<T>,
    O: AssignmentOracle<T>,
{
    sync_initial_params(ctx, solver.model_mut());

    let world = ctx.world_size();
    let mut total_batch = 0usize;
    let mut epoch_losses = Vec::with_capacity(cfg.epochs);

    for epoch in 0..cfg.epochs {
        let indices: Vec<usize> = (0..dataset.len()).collect();
        let mut acc = T::zero();
        let mut efficient = 0usize;

        for chunk in indices.chunks(world) {
            if matches!(total_batch, 5 | 10 | 1000) {
                save_checkpoints(ctx, solver, cfg, &format!("{}_{total_batch}", cfg.exp_name))?;
            }

            let assigned = chunk.get(ctx.rank()).copied();
            if let Some(loss) = gradient_batch(ctx, solver, dataset, assigned)? {
                acc = acc + loss;
                efficient += 1;
            }
            total_batch += 1;
        }

        let epoch_loss = epoch_mean(ctx, acc, efficient);
        epoch_losses.push(epoch_loss);
        if ctx.is_root() {
            log::info!("epoch {epoch}: mean loss {:?}", epoch_loss.to_f64());
        }
    }

    let count = num::cast::<usize, T>(epoch_losses.len().max(1))
        .expect("epoch count fits in the float type");
    let final_loss = epoch_losses.iter().fold(T::zero(), |a, &b| a + b) / count;

    save_checkpoints(ctx, solver, cfg, &cfg.exp_name)?;

    Ok(TrainReport {
        epoch_losses,
        final_loss,
    })
}

#[cfg(test)]
mod tests {
    use super::{learn_latent, learn_latent_focal, warm_start};
    use crate::dataset::PointCloudDataset;
    use collective::CommGroup;
    use common::config::{SolverConfig, TrainConfig};
    use common::interfaces::LatentModel;
    use solver::Solver;
    use spring_system::{
        synthetic_rollouts, LinearAutoEncoder, NearestNeighbourOracle, SpringConfig,
        SpringEngine,
    };

    const N: usize = 6;
    const HORIZON: usize = 3;

    fn train_cfg(epochs: usize, dir: &std::path::Path) -> TrainConfig<f64> {
        TrainConfig::build()
            .epochs(epochs)
            .focal_size(2)
            .exp_name("latent")
            .pretrained_dir(dir)
            .finalize()
            .unwrap()
    }

    fn build_solver(
        seed: u64,
    ) -> Solver<f64, SpringEngine<f64>, LinearAutoEncoder<f64>, NearestNeighbourOracle> {
        let spring_cfg = SpringConfig::build(N).finalize().unwrap();
        let engine = SpringEngine::new(spring_cfg);
        let model = LinearAutoEncoder::new(N, 8, 1e-3, seed);
        let cfg = SolverConfig::build().horizon(HORIZON).finalize().unwrap();
        Solver::new(engine, model, NearestNeighbourOracle, cfg)
    }

    fn build_dataset() -> PointCloudDataset<f64> {
        let spring_cfg = SpringConfig::build(N).finalize().unwrap();
        PointCloudDataset::new(synthetic_rollouts(&spring_cfg, 4, HORIZON, 3))
    }

    #[test]
    fn test_focal_training_keeps_ranks_bit_identical() {
        let dir = std::env::temp_dir().join("focal_sync_test");
        let _ = std::fs::remove_dir_all(&dir);

        // Ranks seed their models differently on purpose; the initial
        // broadcast and per-batch gradient averaging must still keep every
        // replica identical.
        let results = CommGroup::run(2, |ctx| {
            let mut solver = build_solver(ctx.rank() as u64);
            let mut dataset = build_dataset();
            let cfg = train_cfg(6, &std::env::temp_dir().join("focal_sync_test"));
            let report = learn_latent_focal(&ctx, &mut solver, &mut dataset, &cfg).unwrap();
            let params = solver.model_mut().parameter_rope_mut().to_vec();
            (report, params)
        });

        let (report_a, params_a) = &results[0];
        let (report_b, params_b) = &results[1];

        assert_eq!(report_a.epoch_losses.len(), 6);
        assert!(report_a.epoch_losses.iter().all(|l| l.is_finite()));
        assert_eq!(report_a.epoch_losses, report_b.epoch_losses);

        assert_eq!(params_a.len(), params_b.len());
        for (a, b) in params_a.iter().zip(params_b) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_focal_training_writes_final_checkpoints() {
        let dir = std::env::temp_dir().join("focal_checkpoint_test");
        let _ = std::fs::remove_dir_all(&dir);

        CommGroup::run(1, |ctx| {
            let mut solver = build_solver(0);
            let mut dataset = build_dataset();
            let cfg = train_cfg(2, &std::env::temp_dir().join("focal_checkpoint_test"));
            learn_latent_focal(&ctx, &mut solver, &mut dataset, &cfg).unwrap();
        });

        assert!(dir.join("latent_model.pth").is_file());
        assert!(dir.join("latent_encoder.pth").is_file());
    }

    #[test]
    fn test_plain_training_writes_mid_run_checkpoints() {
        let dir = std::env::temp_dir().join("plain_checkpoint_test");
        let _ = std::fs::remove_dir_all(&dir);

        // 4 samples over 2 epochs on one rank is 8 batches: the counter
        // reads 5 going into the sixth batch, never 10.
        CommGroup::run(1, |ctx| {
            let mut solver = build_solver(0);
            let mut dataset = build_dataset();
            let cfg = train_cfg(2, &std::env::temp_dir().join("plain_checkpoint_test"));
            learn_latent(&ctx, &mut solver, &mut dataset, &cfg).unwrap();
        });

        assert!(dir.join("latent_5_model.pth").is_file());
        assert!(dir.join("latent_5_encoder.pth").is_file());
        assert!(!dir.join("latent_10_model.pth").exists());
    }

    #[test]
    fn test_mid_run_checkpoint_waits_for_the_sixth_batch() {
        let dir = std::env::temp_dir().join("plain_checkpoint_cadence_test");
        let _ = std::fs::remove_dir_all(&dir);

        // Exactly 5 batches: the pre-batch counter only ever reads 0..=4,
        // so no mid-run pair is written.
        CommGroup::run(1, |ctx| {
            let mut solver = build_solver(0);
            let spring_cfg = SpringConfig::build(N).finalize().unwrap();
            let mut dataset =
                PointCloudDataset::new(synthetic_rollouts(&spring_cfg, 5, HORIZON, 3));
            let cfg = train_cfg(1, &std::env::temp_dir().join("plain_checkpoint_cadence_test"));
            learn_latent(&ctx, &mut solver, &mut dataset, &cfg).unwrap();
        });

        assert!(!dir.join("latent_5_model.pth").exists());
        assert!(dir.join("latent_model.pth").is_file());
    }

    #[test]
    fn test_warm_start_loads_an_existing_checkpoint() {
        let dir = std::env::temp_dir().join("warm_start_test");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("latent_model.pth");

        let donor = LinearAutoEncoder::new(N, 8, 1e-3, 7);
        donor.save(&path).unwrap();

        let mut model = LinearAutoEncoder::new(N, 8, 1e-3, 0);
        assert!(warm_start(&mut model, &path).unwrap());

        let mut donor = donor;
        assert_eq!(
            model.parameter_rope_mut().to_vec(),
            donor.parameter_rope_mut().to_vec()
        );
    }

    #[test]
    fn test_warm_start_skips_a_missing_checkpoint() {
        let dir = std::env::temp_dir().join("warm_start_missing_test");
        let _ = std::fs::remove_dir_all(&dir);

        let mut model = LinearAutoEncoder::new(N, 8, 1e-3, 0);
        let before = model.parameter_rope_mut().to_vec();
        assert!(!warm_start(&mut model, &dir.join("latent_model.pth")).unwrap());
        assert_eq!(model.parameter_rope_mut().to_vec(), before);
    }

    #[test]
    fn test_eval_epoch_populates_the_loss_table() {
        CommGroup::run(1, |ctx| {
            let mut solver = build_solver(0);
            let mut dataset = build_dataset();
            // One epoch: the initial phase is evaluation, so every sample
            // gets a recorded loss.
            let dir = std::env::temp_dir().join("eval_table_test");
            let cfg = train_cfg(1, &dir);
            learn_latent_focal(&ctx, &mut solver, &mut dataset, &cfg).unwrap();

            for i in 0..dataset.len() {
                assert!(dataset.loss(i) > 0.0, "sample {i} was never evaluated");
            }
        });
    }

    #[test]
    fn test_nan_gradients_leave_parameters_untouched() {
        use common::error::EngineError;
        use common::interfaces::RolloutEngine;
        use common::state::{Action, Frame, ParticleState};
        use common::vector::Vector;
        use std::path::Path;

        /// Engine whose adjoint pass always diverges.
        struct NanEngine {
            loss: f64,
        }

        impl RolloutEngine<f64> for NanEngine {
            fn n_particles(&self) -> usize {
                N
            }
            fn action_dim(&self) -> usize {
                3
            }
            fn reset_to(
                &mut self,
                _state: &ParticleState<f64>,
                _softness: f64,
                _soft_reset: bool,
            ) -> Result<(), EngineError> {
                self.loss = 0.0;
                Ok(())
            }
            fn set_target(&mut self, _target: &Frame<f64>) {}
            fn step(&mut self, _action: &Action<f64>) {}
            fn accumulate_loss(&mut self, _decay: f64) {
                self.loss += 1.0;
            }
            fn start_recording(&mut self) {}
            fn stop_recording(&mut self) {}
            fn loss(&self) -> f64 {
                self.loss
            }
            fn state_gradient(&self) -> Frame<f64> {
                vec![Vector::new([f64::NAN, 0.0, 0.0]); N]
            }
            fn action_gradients(&self) -> Vec<Action<f64>> {
                vec![]
            }
            fn snapshot(&self) -> ParticleState<f64> {
                ParticleState::zeroed(N, 3)
            }
            fn save_state(&self, _path: &Path) -> Result<(), EngineError> {
                Ok(())
            }
        }

        CommGroup::run(1, |ctx| {
            let model = LinearAutoEncoder::new(N, 8, 1e-3, 0);
            let cfg = SolverConfig::build().horizon(HORIZON).finalize().unwrap();
            let mut solver = Solver::new(NanEngine { loss: 0.0 }, model, NearestNeighbourOracle, cfg);
            let mut dataset = build_dataset();

            let params_before = solver.model_mut().parameter_rope_mut().to_vec();

            // Two epochs: evaluation, then one gated gradient epoch.
            let dir = std::env::temp_dir().join("nan_gate_train_test");
            let cfg = train_cfg(2, &dir);
            let report = learn_latent_focal(&ctx, &mut solver, &mut dataset, &cfg).unwrap();

            // Every gradient was gated, so the epoch mean is the
            // zero-weight fallback and the parameters never moved.
            assert_eq!(report.epoch_losses[1], 0.0);
            let params_after = solver.model_mut().parameter_rope_mut().to_vec();
            assert_eq!(params_before, params_after);
        });
    }
}
