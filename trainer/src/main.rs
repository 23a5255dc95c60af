//! Launches a focal training run of the linear autoencoder against the
//! in-tree spring system.

use collective::{suggested_worker_count, CommGroup};
use color_eyre::eyre::{eyre, Result};
use common::config::{LossKind, SolverConfig, TrainConfig};
use solver::Solver;
use spring_system::{
    synthetic_rollouts, LinearAutoEncoder, NearestNeighbourOracle, SpringConfig, SpringEngine,
};
use trainer::{learn_latent_focal, warm_start, PointCloudDataset};

/// Particles per cloud.
const N_PARTICLES: usize = 64;
/// Latent code width.
const LATENT_DIM: usize = 32;
/// Steps per rollout.
const HORIZON: usize = 20;
/// Rollouts in the synthetic dataset.
const N_SAMPLES: usize = 32;

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let train_cfg = TrainConfig::<f64>::build()
        .epochs(20)
        .batch_size(4)
        .focal_size(16)
        .finalize()?;
    let solver_cfg = SolverConfig::<f64>::build().horizon(HORIZON).finalize()?;
    std::fs::create_dir_all(&train_cfg.output_dir)?;

    let world = suggested_worker_count(train_cfg.batch_size, train_cfg.procs_per_device);
    log::info!("launching {world} workers for experiment {:?}", train_cfg.exp_name);

    let reports = CommGroup::run(world, |ctx| -> Result<_> {
        let spring_cfg = SpringConfig::build(N_PARTICLES)
            .loss_kind(LossKind::Emd)
            .finalize()?;
        let engine = SpringEngine::new(spring_cfg.clone());
        let mut model = LinearAutoEncoder::new(N_PARTICLES, LATENT_DIM, train_cfg.lr, train_cfg.seed);
        let pretrained = train_cfg
            .pretrained_dir
            .join(format!("{}_model.pth", train_cfg.exp_name));
        if !warm_start(&mut model, &pretrained)? && ctx.is_root() {
            log::info!("no pretrained weights at {pretrained:?}, starting fresh");
        }
        let mut solver = Solver::new(engine, model, NearestNeighbourOracle, solver_cfg.clone());
        let mut dataset = PointCloudDataset::new(synthetic_rollouts(
            &spring_cfg,
            N_SAMPLES,
            HORIZON,
            train_cfg.seed,
        ));

        learn_latent_focal(&ctx, &mut solver, &mut dataset, &train_cfg)
    });

    for (rank, report) in reports.into_iter().enumerate() {
        let report = report.map_err(|e| eyre!("worker {rank} failed: {e:?}"))?;
        if rank == 0 {
            log::info!("run finished: final mean loss {}", report.final_loss);
        }
    }

    Ok(())
}
