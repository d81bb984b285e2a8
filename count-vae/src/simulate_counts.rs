use crate::cli_common::*;

use count_vae::count_io::mkdir;
use count_vae::simulate::*;

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// number of rows (cells)
    #[arg(short, long, default_value_t = 500)]
    rows: usize,

    /// number of columns (features)
    #[arg(short, long, default_value_t = 200)]
    cols: usize,

    /// true latent dimension
    #[arg(short, long, default_value_t = 5)]
    factors: usize,

    /// expected library size per row
    #[arg(short, long, default_value_t = 2000)]
    depth: usize,

    /// negative binomial dispersion
    #[arg(long, default_value_t = 10.)]
    overdisp: f32,

    /// standard deviation of the true decoder logits
    #[arg(long, default_value_t = 1.)]
    signal: f32,

    /// random seed
    #[arg(long, default_value_t = 42)]
    rseed: u64,

    /// output header
    #[arg(short, long, required = true)]
    out: Box<str>,

    /// verbosity
    #[arg(long, short)]
    verbose: bool,
}

pub fn run_simulate(args: &SimulateArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);

    mkdir(&args.out)?;

    let sim_args = SimArgs {
        rows: args.rows,
        cols: args.cols,
        factors: args.factors,
        depth: args.depth,
        overdisp: args.overdisp,
        signal: args.signal,
        rseed: args.rseed,
    };

    simulate_nb_counts_to_files(&sim_args, &args.out)?;
    info!("Done");
    Ok(())
}
