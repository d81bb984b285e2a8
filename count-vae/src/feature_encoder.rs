use candle_core::{Result, Tensor, D};
use candle_nn::{ops, Activation, Linear, Module, VarBuilder};
use candle_util::candle_aux_layers::{feed_forward, StackLayers};
use serde::{Deserialize, Serialize};

/// Output link of a [`FeatureEncoder`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputLink {
    Identity,
    /// strictly positive output
    Exp,
    /// each row on the probability simplex
    Softmax,
}

impl Module for OutputLink {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Identity => Ok(x.clone()),
            Self::Exp => x.exp(),
            Self::Softmax => ops::softmax(x, D::Minus1),
        }
    }
}

/// Two-layer feed-forward transform
///
/// ```text
/// x -> affine(n_input, n_hidden) -> relu -> affine(n_hidden, n_output) -> link
/// ```
pub struct FeatureEncoder {
    n_input: usize,
    fc: StackLayers<Linear>,
    link: OutputLink,
}

impl FeatureEncoder {
    /// Will create a new feed-forward transform with these variables:
    ///
    /// * `fc.0.weight`, `fc.0.bias` (n_hidden x n_input)
    /// * `fc.1.weight`, `fc.1.bias` (n_output x n_hidden)
    ///
    /// # Arguments
    /// * `n_input` - input width
    /// * `n_output` - output width
    /// * `n_hidden` - hidden width
    /// * `link` - output link function
    /// * `vs` - variable builder
    pub fn new(
        n_input: usize,
        n_output: usize,
        n_hidden: usize,
        link: OutputLink,
        vs: VarBuilder,
    ) -> Result<Self> {
        let fc = feed_forward(&[n_input, n_hidden, n_output], Activation::Relu, vs)?;

        Ok(Self {
            n_input,
            fc,
            link,
        })
    }
}

impl Module for FeatureEncoder {
    fn forward(&self, x_nd: &Tensor) -> Result<Tensor> {
        let d = x_nd.dim(D::Minus1)?;
        if d != self.n_input {
            return Err(candle_core::Error::Msg(format!(
                "expected {} input features, but found {}",
                self.n_input, d
            )));
        }
        self.link.forward(&self.fc.forward(x_nd)?)
    }
}
