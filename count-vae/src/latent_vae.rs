use crate::cli_common::*;

use candle_util::candle_data_loader::InMemoryData;
use candle_util::candle_noise::NoiseSource;
use count_vae::count_io::*;
use count_vae::nb_vae_config::NbVaeConfig;
use count_vae::nb_vae_networks::NbVaeNetworks;
use count_vae::posterior::*;
use rand::SeedableRng;
use std::path::Path;

#[derive(Args, Debug)]
pub struct LatentArgs {
    /// Count matrix (rows = cells, columns = features), `.tsv` or `.tsv.gz`
    #[arg(required = true)]
    data_file: Box<str>,

    /// The first line of the data file holds feature names
    #[arg(long, default_value_t = false)]
    header: bool,

    /// Output header of a previous `fit` run
    #[arg(long, required = true)]
    model: Box<str>,

    /// Output header
    #[arg(long, short, required = true)]
    out: Box<str>,

    /// Draw latent states from the posterior instead of taking its mean
    #[arg(long, default_value_t = false)]
    sample: bool,

    /// Also write decoded proportions at the posterior mean
    #[arg(long, default_value_t = false)]
    normalized: bool,

    /// Also write a posterior predictive replicate of the counts
    #[arg(long, default_value_t = false)]
    predictive: bool,

    /// Random seed for posterior draws
    #[arg(long, short = 's', default_value_t = 42)]
    seed: u64,

    /// Block size (# rows) for evaluation
    #[arg(long, default_value_t = 1000)]
    block_size: usize,

    /// candle device
    #[arg(long, value_enum, default_value = "cpu")]
    device: ComputeDevice,

    /// verbosity
    #[arg(long, short)]
    verbose: bool,
}

pub fn evaluate_latent(args: &LatentArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);

    let config_file = format!("{}.config.json", args.model);
    let model_file = format!("{}.model.safetensors", args.model);

    let config = NbVaeConfig::from_json_file(Path::new(&config_file))?;

    let counts = read_count_matrix(&args.data_file, args.header)?;
    let (nn, dd) = counts.data.dim();
    if dd != config.n_input {
        return Err(anyhow::anyhow!(
            "the model expects {} features, but {} has {}",
            config.n_input,
            args.data_file,
            dd
        ));
    }
    info!("Read {} x {} counts from {}", nn, dd, args.data_file);

    let dev = args.device.to_device()?;

    let mut parameters = candle_nn::VarMap::new();
    let param_builder =
        candle_nn::VarBuilder::from_varmap(&parameters, candle_core::DType::F32, &dev);
    let networks = NbVaeNetworks::new(&config, param_builder)?;
    parameters.load(&model_file)?;
    info!("Loaded parameters from {}", model_file);

    let data = InMemoryData::new(&counts.data)?;
    let noise = NoiseSource::from_seed(args.seed);

    mkdir(&args.out)?;

    let latent_file = format!("{}.latent.tsv.gz", args.out);
    let noise_opt = if args.sample { Some(&noise) } else { None };
    let z_nk = latent_representation(&networks, &data, args.block_size, &dev, noise_opt)?;
    write_matrix_tsv(&z_nk, None, &latent_file)?;
    info!("wrote {:?}", latent_file);

    if args.normalized {
        let normalized_file = format!("{}.normalized.tsv.gz", args.out);
        let px_nd = normalized_expression(&networks, &data, args.block_size, &dev)?;
        write_matrix_tsv(&px_nd, counts.columns.as_deref(), &normalized_file)?;
        info!("wrote {:?}", normalized_file);
    }

    if args.predictive {
        let predictive_file = format!("{}.predictive.tsv.gz", args.out);
        let mut rng = rand::rngs::StdRng::seed_from_u64(args.seed);
        let y_nd =
            posterior_predictive_sample(&networks, &data, args.block_size, &dev, &noise, &mut rng)?;
        write_matrix_tsv(&y_nd, counts.columns.as_deref(), &predictive_file)?;
        info!("wrote {:?}", predictive_file);
    }

    info!("Done");
    Ok(())
}
