use crate::cli_common::*;

use candle_util::candle_data_loader::InMemoryData;
use candle_util::candle_inference::{num_parameters, TrainConfig};
use candle_util::candle_noise::NoiseSource;
use candle_util::candle_vae_inference::{evaluate_vae, train_svi, train_vae};
use candle_util::svi::TraceElbo;
use count_vae::count_io::*;
use count_vae::nb_vae_config::NbVaeConfig;
use count_vae::nb_vae_guided::NbVaeGuided;
use count_vae::nb_vae_module::NbVaeModule;
use count_vae::posterior::latent_representation;
use std::path::Path;
use std::sync::Arc;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum FitMethod {
    /// inference -> generative -> loss routines
    Manual,
    /// model/guide declarations with a trace ELBO
    Guide,
}

#[derive(Args, Debug)]
pub struct FitArgs {
    /// Count matrix (rows = cells, columns = features), `.tsv` or `.tsv.gz`
    #[arg(required = true)]
    data_file: Box<str>,

    /// The first line of the data file holds feature names
    #[arg(long, default_value_t = false)]
    header: bool,

    /// Output header
    #[arg(long, short, required = true)]
    out: Box<str>,

    /// Training path
    #[arg(long, short = 'm', value_enum, default_value = "manual")]
    method: FitMethod,

    /// Latent dimension
    #[arg(short = 'k', long, default_value_t = 10)]
    n_latent: usize,

    /// Hidden layer width of every network
    #[arg(long, default_value_t = 128)]
    n_hidden: usize,

    /// # training epochs
    #[arg(long, short = 'i', default_value_t = 100)]
    epochs: usize,

    /// Minibatch size
    #[arg(long, default_value_t = 128)]
    minibatch_size: usize,

    #[arg(long, default_value_t = 1e-3)]
    learning_rate: f32,

    /// KL warm-up epochs; the KL weight grows as `1 - exp(-epoch / warmup)`
    #[arg(long, default_value_t = 0.)]
    kl_warmup: f64,

    /// Monte Carlo particles per step (guide only)
    #[arg(long, default_value_t = 1)]
    particles: usize,

    /// Closed-form KL instead of the sampled estimate (guide only)
    #[arg(long, default_value_t = false)]
    analytic_kl: bool,

    /// Random seed for noise and minibatch shuffling
    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// Block size (# rows) when evaluating the fitted model
    #[arg(long, default_value_t = 1000)]
    block_size: usize,

    /// candle device
    #[arg(long, value_enum, default_value = "cpu")]
    device: ComputeDevice,

    /// verbosity
    #[arg(long, short)]
    verbose: bool,
}

pub fn fit_count_vae(args: &FitArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);

    // 1. Read the data
    let counts = read_count_matrix(&args.data_file, args.header)?;
    let (nn, dd) = counts.data.dim();
    info!("Read {} x {} counts from {}", nn, dd, args.data_file);

    let config = NbVaeConfig::new(dd)
        .with_latent(args.n_latent)
        .with_hidden(args.n_hidden);
    config.validate()?;

    let dev = args.device.to_device()?;

    let noise = Arc::new(match args.seed {
        Some(seed) => NoiseSource::from_seed(seed),
        None => NoiseSource::from_entropy(),
    });

    let mut data = InMemoryData::new(&counts.data)?;
    if let Some(seed) = args.seed {
        data = data.with_seed(seed);
    }

    // 2. Register parameters; both paths share the same names
    let parameters = candle_nn::VarMap::new();
    let param_builder =
        candle_nn::VarBuilder::from_varmap(&parameters, candle_core::DType::F32, &dev);

    let module = NbVaeModule::new(&config, param_builder.clone(), noise.clone())?;
    info!("{} parameters", num_parameters(&parameters));

    let train_config = TrainConfig {
        learning_rate: args.learning_rate,
        batch_size: args.minibatch_size,
        num_epochs: args.epochs,
        kl_warmup_epochs: args.kl_warmup,
        device: dev.clone(),
        verbose: args.verbose,
        show_progress: true,
    };

    // 3. Train
    let scores = match args.method {
        FitMethod::Manual => train_vae(&module, &parameters, &mut data, &train_config)?,
        FitMethod::Guide => {
            let guided = NbVaeGuided::new(&config, param_builder.clone())?;
            let estimator = TraceElbo {
                num_particles: args.particles,
                analytic_kl: args.analytic_kl,
            };
            train_svi(
                &guided,
                &parameters,
                &mut data,
                &estimator,
                &noise,
                &train_config,
            )?
        }
    };

    let eval = evaluate_vae(&module, &data, args.block_size, &dev)?;
    info!(
        "ELBO per row: {:.4} (reconstruction: {:.4}, kl: {:.4})",
        eval.elbo, eval.reconstruction, eval.kl
    );

    // 4. Write down the results
    mkdir(&args.out)?;

    let model_file = format!("{}.model.safetensors", args.out);
    let config_file = format!("{}.config.json", args.out);
    let latent_file = format!("{}.latent.tsv.gz", args.out);
    let scores_file = format!("{}.scores.tsv", args.out);

    parameters.save(&model_file)?;
    config.to_json_file(Path::new(&config_file))?;
    write_scores(&scores, &scores_file)?;

    let z_nk = latent_representation(module.networks(), &data, args.block_size, &dev, None)?;
    write_matrix_tsv(&z_nk, None, &latent_file)?;

    info!(
        "wrote:\n{:?},\n{:?},\n{:?},\n{:?}",
        model_file, config_file, scores_file, latent_file
    );
    info!("Done");
    Ok(())
}
