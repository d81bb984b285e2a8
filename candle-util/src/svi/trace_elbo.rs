use candle_core::{Result, Tensor};

use super::distributions::kl_divergence;
use super::trace::LatentValues;
use super::traits::ProbabilisticModuleT;
use crate::candle_noise::NoiseSource;

/// Configuration of the trace ELBO estimator
#[derive(Debug, Clone)]
pub struct TraceElbo {
    /// Number of Monte Carlo particles averaged per evaluation
    pub num_particles: usize,
    /// Use closed-form KL(q || p) wherever it exists instead of
    /// the single-sample estimate `log q(z) - log p(z)`
    pub analytic_kl: bool,
}

impl Default for TraceElbo {
    fn default() -> Self {
        Self {
            num_particles: 1,
            analytic_kl: false,
        }
    }
}

/// Per-row ELBO components, averaged over particles
pub struct ElboTerms {
    /// sum of observed log-likelihoods (n,)
    pub log_likelihood: Tensor,
    /// KL(q || p) summed over latent sites (n,)
    pub kl: Tensor,
}

impl ElboTerms {
    /// log-likelihood - KL
    pub fn elbo(&self) -> Result<Tensor> {
        self.log_likelihood.sub(&self.kl)
    }

    /// -mean(log-likelihood - kl_weight * KL)
    pub fn loss(&self, kl_weight: f64) -> Result<Tensor> {
        self.log_likelihood
            .sub(&(&self.kl * kl_weight)?)?
            .mean_all()?
            .neg()
    }
}

impl TraceElbo {
    pub fn new(num_particles: usize) -> Self {
        Self {
            num_particles,
            analytic_kl: false,
        }
    }

    /// Mean-field variant with closed-form KL terms
    pub fn mean_field(num_particles: usize) -> Self {
        Self {
            num_particles,
            analytic_kl: true,
        }
    }

    /// Evaluate the ELBO components of `module` on `args`
    ///
    /// For each particle: run the guide, draw every latent site by
    /// reparameterization, replay the model on those draws and score
    /// the observed sites.
    pub fn elbo_terms<M>(
        &self,
        module: &M,
        args: &M::Args,
        noise: &NoiseSource,
    ) -> Result<ElboTerms>
    where
        M: ProbabilisticModuleT,
    {
        if self.num_particles == 0 {
            return Err(candle_core::Error::Msg("need at least one particle".into()));
        }

        let mut llik_tot: Option<Tensor> = None;
        let mut kl_tot: Option<Tensor> = None;

        for _ in 0..self.num_particles {
            let guide = module.guide(args)?;

            let mut latents = LatentValues::new();
            for site in guide.latent_sites() {
                latents.insert(&site.name, site.dist.rsample(noise)?);
            }

            let model = module.model(args, &latents)?;

            if model.latent_sites().len() != guide.latent_sites().len() {
                return Err(candle_core::Error::Msg(format!(
                    "model declares {} latent sites but guide declares {}",
                    model.latent_sites().len(),
                    guide.latent_sites().len()
                )));
            }

            let mut llik: Option<Tensor> = None;
            for site in model.observed_sites() {
                llik = accumulate(llik, site.dist.event_log_prob(&site.value)?)?;
            }
            let llik = llik.ok_or_else(|| {
                candle_core::Error::Msg("model has no observed site".into())
            })?;

            let mut kl: Option<Tensor> = None;
            for prior in model.latent_sites() {
                let q = guide.site(&prior.name).ok_or_else(|| {
                    candle_core::Error::Msg(format!("guide misses latent site `{}`", prior.name))
                })?;

                let analytic = if self.analytic_kl {
                    kl_divergence(&q.dist, &prior.dist)?
                } else {
                    None
                };

                let kl_n = match analytic {
                    Some(kl_nk) => kl_nk.sum(kl_nk.rank() - 1)?,
                    None => {
                        let z = latents.get(&prior.name)?;
                        q.dist
                            .event_log_prob(z)?
                            .sub(&prior.dist.event_log_prob(z)?)?
                    }
                };
                kl = accumulate(kl, kl_n)?;
            }
            let kl = match kl {
                Some(kl) => kl,
                None => llik.zeros_like()?,
            };

            llik_tot = accumulate(llik_tot, llik)?;
            kl_tot = accumulate(kl_tot, kl)?;
        }

        let np = self.num_particles as f64;
        match (llik_tot, kl_tot) {
            (Some(llik), Some(kl)) => Ok(ElboTerms {
                log_likelihood: (llik / np)?,
                kl: (kl / np)?,
            }),
            _ => Err(candle_core::Error::Msg("empty ELBO".into())),
        }
    }

    /// Per-row ELBO
    pub fn elbo<M>(&self, module: &M, args: &M::Args, noise: &NoiseSource) -> Result<Tensor>
    where
        M: ProbabilisticModuleT,
    {
        self.elbo_terms(module, args, noise)?.elbo()
    }

    /// Negative mean ELBO, to be minimized
    pub fn loss<M>(&self, module: &M, args: &M::Args, noise: &NoiseSource) -> Result<Tensor>
    where
        M: ProbabilisticModuleT,
    {
        self.elbo_terms(module, args, noise)?.loss(1.0)
    }
}

fn accumulate(acc: Option<Tensor>, x: Tensor) -> Result<Option<Tensor>> {
    match acc {
        None => Ok(Some(x)),
        Some(acc) => Ok(Some(acc.add(&x)?)),
    }
}
