//! Stochastic variational inference over model/guide declarations.
//!
//! A [`ProbabilisticModuleT`] describes its generative process as a
//! [`ModelTrace`] (prior draws, deterministic transforms, observed
//! likelihoods) and its approximate posterior as a [`GuideTrace`].
//! [`TraceElbo`] turns the pair into an ELBO by drawing each latent
//! site from the guide with reparameterization, replaying the model on
//! those draws, and scoring both.
//!
//! ```text
//! ELBO = E_q[ log p(x | z) + log p(z) - log q(z) ]
//! ```
//!
//! # Example
//!
//! ```ignore
//! let estimator = TraceElbo::new(1);
//! let args = module.args_from_batch(&minibatch)?;
//! let loss = estimator.loss(&module, &args, &noise)?;
//! optimizer.backward_step(&loss)?;
//! ```

mod distributions;
mod trace;
mod trace_elbo;
mod traits;

pub use distributions::{kl_divergence, Distribution};
pub use trace::{GuideTrace, LatentValues, ModelTrace, ObservedSite, SampleSite};
pub use trace_elbo::{ElboTerms, TraceElbo};
pub use traits::ProbabilisticModuleT;
