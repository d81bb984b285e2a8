use crate::candle_data_loader::MinibatchData;
use candle_core::{Result, Tensor};

/// Loss of a single forward pass
pub struct LossOutput {
    /// scalar to minimize
    pub loss: Tensor,
    /// per-row negative log-likelihood (n,)
    pub reconstruction_loss: Tensor,
    /// per-row KL divergence (n,)
    pub kl_local: Tensor,
}

impl LossOutput {
    /// Per-row evidence lower bound, `-(reconstruction + kl)`
    pub fn elbo(&self) -> Result<Tensor> {
        self.reconstruction_loss.add(&self.kl_local)?.neg()
    }
}

/// A variational module driven by an external trainer.
///
/// The trainer calls the routines in a fixed order:
/// `get_inference_input` -> `inference` -> `get_generative_input`
/// -> `generative` -> `loss`, then differentiates `loss.loss`.
/// None of the routines update parameters.
pub trait VaeModuleT {
    type InferenceInput;
    type InferenceOutput;
    type GenerativeInput;
    type GenerativeOutput;

    /// Pick the tensors `inference` needs out of a minibatch
    fn get_inference_input(&self, batch: &MinibatchData) -> Result<Self::InferenceInput>;

    /// Observation -> variational parameters and a latent draw
    fn inference(&self, input: &Self::InferenceInput) -> Result<Self::InferenceOutput>;

    /// Pick the tensors `generative` needs out of a minibatch and
    /// the inference output
    fn get_generative_input(
        &self,
        batch: &MinibatchData,
        inference_output: &Self::InferenceOutput,
    ) -> Result<Self::GenerativeInput>;

    /// Latent state -> likelihood parameters
    fn generative(&self, input: &Self::GenerativeInput) -> Result<Self::GenerativeOutput>;

    /// Combine everything into the objective
    ///
    /// * `kl_weight` - multiplier on the KL term; 1 gives the ELBO
    fn loss(
        &self,
        batch: &MinibatchData,
        inference_output: &Self::InferenceOutput,
        generative_output: &Self::GenerativeOutput,
        kl_weight: f64,
    ) -> Result<LossOutput>;

    /// Run all four routines in order
    fn forward(
        &self,
        batch: &MinibatchData,
        kl_weight: f64,
    ) -> Result<(Self::InferenceOutput, Self::GenerativeOutput, LossOutput)> {
        let inference_input = self.get_inference_input(batch)?;
        let inference_output = self.inference(&inference_input)?;
        let generative_input = self.get_generative_input(batch, &inference_output)?;
        let generative_output = self.generative(&generative_input)?;
        let loss = self.loss(batch, &inference_output, &generative_output, kl_weight)?;
        Ok((inference_output, generative_output, loss))
    }
}
