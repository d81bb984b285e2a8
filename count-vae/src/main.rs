mod cli_common;
mod fit_vae;
mod latent_vae;
mod simulate_counts;

use clap::{Parser, Subcommand};
use fit_vae::*;
use latent_vae::*;
use simulate_counts::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "COUNT-VAE",
    long_about = "Variational autoencoder with a negative binomial likelihood\n\
		  for single-cell count matrices (rows = cells, columns = genes).\n\
		  Data files are whitespace-separated, optionally gzipped."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Fit a count VAE",
        long_about = "Fit a negative binomial VAE in the three stages: \n\
		      (1) Read a count matrix\n\
		      (2) Maximize the ELBO by minibatch SGD, either through\n\
		      the manual routines or the model/guide declarations\n\
		      (3) Write the parameters, training scores and latent states.\n"
    )]
    Fit(FitArgs),

    #[command(
        about = "Evaluate latent states with a fitted model",
        long_about = "Load the parameters of a previous `fit` run and\n\
		      map a count matrix to the latent space.\n\
		      Optionally write normalized expression and\n\
		      a posterior predictive replicate of the data.\n"
    )]
    Latent(LatentArgs),

    /// simulate counts from a negative binomial latent-factor model
    Simulate(SimulateArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    rayon::ThreadPoolBuilder::new()
        .num_threads(num_cpus::get())
        .build_global()?;

    match &cli.commands {
        Commands::Fit(args) => {
            fit_count_vae(args)?;
        }
        Commands::Latent(args) => {
            evaluate_latent(args)?;
        }
        Commands::Simulate(args) => {
            run_simulate(args)?;
        }
    }

    Ok(())
}
