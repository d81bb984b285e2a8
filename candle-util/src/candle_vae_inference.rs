use crate::candle_data_loader::{DataLoader, MinibatchData};
use crate::candle_inference::TrainConfig;
use crate::candle_model_traits::VaeModuleT;
use crate::candle_noise::NoiseSource;
use crate::svi::{ProbabilisticModuleT, TraceElbo};

use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, VarMap};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

/// Per-epoch training trace
#[derive(Debug, Default, Clone)]
pub struct TrainScores {
    /// average minibatch loss
    pub loss: Vec<f32>,
    /// average per-row negative log-likelihood
    pub reconstruction: Vec<f32>,
    /// average per-row KL divergence
    pub kl: Vec<f32>,
}

impl TrainScores {
    pub fn num_epochs(&self) -> usize {
        self.loss.len()
    }

    /// Average per-row ELBO of each epoch
    pub fn elbo(&self) -> Vec<f32> {
        self.reconstruction
            .iter()
            .zip(self.kl.iter())
            .map(|(r, k)| -(r + k))
            .collect()
    }
}

/// Data-set averages of a fitted module
#[derive(Debug, Clone, Copy)]
pub struct EvalScores {
    pub elbo: f32,
    pub reconstruction: f32,
    pub kl: f32,
}

struct EpochStat {
    loss_tot: f32,
    recon_tot: f32,
    kl_tot: f32,
    nbatch: usize,
    nrow: usize,
}

impl EpochStat {
    fn new() -> Self {
        Self {
            loss_tot: 0.,
            recon_tot: 0.,
            kl_tot: 0.,
            nbatch: 0,
            nrow: 0,
        }
    }

    fn add(&mut self, loss: &Tensor, recon_n: &Tensor, kl_n: &Tensor) -> candle_core::Result<()> {
        self.loss_tot += loss.to_scalar::<f32>()?;
        self.recon_tot += recon_n.sum_all()?.to_scalar::<f32>()?;
        self.kl_tot += kl_n.sum_all()?.to_scalar::<f32>()?;
        self.nbatch += 1;
        self.nrow += recon_n.dim(0)?;
        Ok(())
    }

    fn push_to(&self, scores: &mut TrainScores) {
        let nb = self.nbatch.max(1) as f32;
        let nr = self.nrow.max(1) as f32;
        scores.loss.push(self.loss_tot / nb);
        scores.reconstruction.push(self.recon_tot / nr);
        scores.kl.push(self.kl_tot / nr);
    }
}

/// One minibatch step: returns (scalar loss, per-row reconstruction
/// loss, per-row KL)
type StepOut = (Tensor, Tensor, Tensor);

fn train_loop<DataL, StepFn>(
    data: &mut DataL,
    train_config: &TrainConfig,
    mut step: StepFn,
) -> anyhow::Result<TrainScores>
where
    DataL: DataLoader,
    StepFn: FnMut(&MinibatchData, f64) -> anyhow::Result<StepOut>,
{
    let device = &train_config.device;

    let pb = ProgressBar::new(train_config.num_epochs as u64);
    if !train_config.show_progress || train_config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut scores = TrainScores::default();

    for epoch in 0..train_config.num_epochs {
        data.shuffle_minibatch(train_config.batch_size)?;
        let kl_weight = train_config.kl_weight(epoch);

        let mut stat = EpochStat::new();
        for b in 0..data.num_minibatch() {
            let minibatch = data.minibatch_data(b, device)?;
            let (loss, recon_n, kl_n) = step(&minibatch, kl_weight)?;
            stat.add(&loss, &recon_n, &kl_n)?;
        }
        stat.push_to(&mut scores);
        pb.inc(1);

        if train_config.verbose {
            info!(
                "[{}] loss: {:.4}, reconstruction: {:.4}, kl: {:.4} (weight {:.3})",
                epoch + 1,
                scores.loss[epoch],
                scores.reconstruction[epoch],
                scores.kl[epoch],
                kl_weight
            );
        }
    }

    pb.finish_and_clear();
    Ok(scores)
}

/// Train a module through its inference/generative/loss routines
///
/// * `module` - the module; parameters must live in `variable_map`
/// * `variable_map` - every trainable parameter
/// * `data` - data loader
/// * `train_config` - training configuration
pub fn train_vae<M, DataL>(
    module: &M,
    variable_map: &VarMap,
    data: &mut DataL,
    train_config: &TrainConfig,
) -> anyhow::Result<TrainScores>
where
    M: VaeModuleT,
    DataL: DataLoader,
{
    let mut adam = AdamW::new_lr(
        variable_map.all_vars(),
        train_config.learning_rate.into(),
    )?;

    info!("Start training VAE...");

    let scores = train_loop(data, train_config, |minibatch, kl_weight| {
        let (_, _, out) = module.forward(minibatch, kl_weight)?;
        adam.backward_step(&out.loss)?;
        Ok((out.loss, out.reconstruction_loss, out.kl_local))
    })?;

    info!("done model training");
    Ok(scores)
}

/// Train a module through its model/guide declarations
///
/// * `module` - the module; parameters must live in `variable_map`
/// * `variable_map` - every trainable parameter
/// * `data` - data loader
/// * `estimator` - ELBO estimator
/// * `noise` - noise for reparameterized draws
/// * `train_config` - training configuration
pub fn train_svi<M, DataL>(
    module: &M,
    variable_map: &VarMap,
    data: &mut DataL,
    estimator: &TraceElbo,
    noise: &NoiseSource,
    train_config: &TrainConfig,
) -> anyhow::Result<TrainScores>
where
    M: ProbabilisticModuleT,
    DataL: DataLoader,
{
    let mut adam = AdamW::new_lr(
        variable_map.all_vars(),
        train_config.learning_rate.into(),
    )?;

    info!(
        "Start training model/guide ({} particle(s), analytic KL: {})...",
        estimator.num_particles, estimator.analytic_kl
    );

    let scores = train_loop(data, train_config, |minibatch, kl_weight| {
        let args = module.args_from_batch(minibatch)?;
        let terms = estimator.elbo_terms(module, &args, noise)?;
        let loss = terms.loss(kl_weight)?;
        adam.backward_step(&loss)?;
        Ok((loss, terms.log_likelihood.neg()?, terms.kl))
    })?;

    info!("done model training");
    Ok(scores)
}

/// Average ELBO terms of `module` over all rows of `data`, in order,
/// without touching the parameters
pub fn evaluate_vae<M, DataL>(
    module: &M,
    data: &DataL,
    block_size: usize,
    device: &candle_core::Device,
) -> anyhow::Result<EvalScores>
where
    M: VaeModuleT,
    DataL: DataLoader,
{
    let ntot = data.num_data();
    let block_size = block_size.max(1);

    let mut recon_tot = 0f32;
    let mut kl_tot = 0f32;

    for lb in (0..ntot).step_by(block_size) {
        let ub = (lb + block_size).min(ntot);
        let minibatch = data.minibatch_ordered(lb, ub, device)?;
        let (_, _, out) = module.forward(&minibatch, 1.0)?;
        recon_tot += out.reconstruction_loss.sum_all()?.to_scalar::<f32>()?;
        kl_tot += out.kl_local.sum_all()?.to_scalar::<f32>()?;
    }

    let n = ntot.max(1) as f32;
    Ok(EvalScores {
        elbo: -(recon_tot + kl_tot) / n,
        reconstruction: recon_tot / n,
        kl: kl_tot / n,
    })
}
