use candle_core::Result;

use super::trace::{GuideTrace, LatentValues, ModelTrace};
use crate::candle_data_loader::MinibatchData;

/// A module expressed as a model/guide pair.
///
/// Both declarations are pure functions of their arguments and the
/// module's parameters; sampling, scoring and the ELBO are left to
/// an evaluator such as [`super::TraceElbo`].
pub trait ProbabilisticModuleT {
    type Args;

    /// Build the arguments shared by `model` and `guide` from a minibatch
    fn args_from_batch(&self, batch: &MinibatchData) -> Result<Self::Args>;

    /// Generative process; latent sites read their values from `latents`
    fn model(&self, args: &Self::Args, latents: &LatentValues) -> Result<ModelTrace>;

    /// Approximate posterior over every latent site of the model
    fn guide(&self, args: &Self::Args) -> Result<GuideTrace>;
}
