use crate::count_io::write_matrix_tsv;
use crate::posterior::sample_negative_binomial;

use indicatif::ParallelProgressIterator;
use log::info;
use ndarray::prelude::*;
use rand::SeedableRng;
use rand_distr::{Distribution, LogNormal, StandardNormal};
use rayon::prelude::*;

pub struct SimArgs {
    /// number of observations (cells)
    pub rows: usize,
    /// number of features (genes)
    pub cols: usize,
    /// dimension of the true latent space
    pub factors: usize,
    /// expected library size per row
    pub depth: usize,
    /// negative binomial dispersion; larger is closer to Poisson
    pub overdisp: f32,
    /// standard deviation of the decoder logits
    pub signal: f32,
    pub rseed: u64,
}

impl Default for SimArgs {
    fn default() -> Self {
        Self {
            rows: 500,
            cols: 200,
            factors: 5,
            depth: 2000,
            overdisp: 10.,
            signal: 1.,
            rseed: 42,
        }
    }
}

pub struct SimOut {
    /// simulated counts (rows x cols)
    pub counts: Array2<f32>,
    /// true latent states (rows x factors)
    pub z_nk: Array2<f32>,
    /// true decoder logits (factors x cols)
    pub logits_kd: Array2<f32>,
    /// realized library sizes
    pub library: Vec<f32>,
}

/// Generate counts from a negative binomial latent-factor model
///
/// ```text
/// z(i,:) ~ N(0, I)
/// rho(i,:) = softmax( z(i,:) * W )
/// s(i) ~ depth * LogNormal(0, 0.2)
/// Y(i,j) ~ NB( s(i) * rho(i,j), overdisp )
/// ```
///
/// Each row draws from its own generator seeded by `rseed` and the row
/// index, so the result does not depend on the thread pool.
pub fn simulate_nb_counts(args: &SimArgs) -> anyhow::Result<SimOut> {
    let nn = args.rows;
    let dd = args.cols;
    let kk = args.factors;

    if nn == 0 || dd == 0 || kk == 0 {
        return Err(anyhow::anyhow!(
            "need positive rows, cols and factors: {} x {} x {}",
            nn,
            dd,
            kk
        ));
    }

    if !(args.overdisp > 0.) {
        return Err(anyhow::anyhow!("overdispersion must be positive"));
    }

    let mut rng = rand::rngs::StdRng::seed_from_u64(args.rseed);

    let logits_kd = Array2::<f32>::from_shape_simple_fn((kk, dd), || {
        let x: f32 = StandardNormal.sample(&mut rng);
        x * args.signal
    });

    let z_nk = Array2::<f32>::from_shape_simple_fn((nn, kk), || StandardNormal.sample(&mut rng));
    info!("sampled latent states and decoder weights");

    let lognormal = LogNormal::new(0f32, 0.2)?;
    let depth = args.depth as f32;

    let rows = z_nk
        .axis_iter(Axis(0))
        .into_par_iter()
        .enumerate()
        .progress_count(nn as u64)
        .map(|(i, z_k)| {
            let seed = args.rseed.wrapping_add(1 + i as u64);
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

            let eta_d = z_k.dot(&logits_kd);
            let max_eta = eta_d.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let exp_d = eta_d.mapv(|e| (e - max_eta).exp());
            let rho_d = &exp_d / exp_d.sum();

            let library = depth * lognormal.sample(&mut rng);

            let y_d = rho_d
                .iter()
                .map(|&r| sample_negative_binomial(library * r, args.overdisp, &mut rng))
                .collect::<anyhow::Result<Vec<f32>>>()?;

            Ok((y_d, library))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let library: Vec<f32> = rows.iter().map(|(_, s)| *s).collect();
    let counts = Array2::from_shape_vec(
        (nn, dd),
        rows.into_iter().flat_map(|(y, _)| y).collect(),
    )?;

    info!(
        "sampled {} x {} counts, {} non-zero",
        nn,
        dd,
        counts.iter().filter(|&&y| y > 0.).count()
    );

    Ok(SimOut {
        counts,
        z_nk,
        logits_kd,
        library,
    })
}

/// Simulate and write `{out}.counts.tsv.gz`, `{out}.latent.tsv.gz`
/// and `{out}.logits.tsv.gz`
pub fn simulate_nb_counts_to_files(args: &SimArgs, out: &str) -> anyhow::Result<SimOut> {
    let sim = simulate_nb_counts(args)?;

    let counts_file = format!("{}.counts.tsv.gz", out);
    let latent_file = format!("{}.latent.tsv.gz", out);
    let logits_file = format!("{}.logits.tsv.gz", out);

    write_matrix_tsv(&sim.counts, None, &counts_file)?;
    write_matrix_tsv(&sim.z_nk, None, &latent_file)?;
    write_matrix_tsv(&sim.logits_kd, None, &logits_file)?;

    info!(
        "wrote:\n{:?},\n{:?},\n{:?}",
        counts_file, latent_file, logits_file
    );
    Ok(sim)
}
