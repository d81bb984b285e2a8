use candle_core::{Device, Tensor};
use ndarray::{Array2, Axis};
use rand::prelude::SliceRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::HashMap;

/// The key under which the raw count matrix is stored in a minibatch
pub const X_KEY: &str = "X";

/// A minibatch: named tensors sharing the same leading (row) dimension
pub struct MinibatchData {
    tensors: HashMap<Box<str>, Tensor>,
}

impl MinibatchData {
    /// Wrap a raw count tensor under [`X_KEY`]
    pub fn new(x_nd: Tensor) -> Self {
        let mut tensors = HashMap::new();
        tensors.insert(Box::from(X_KEY), x_nd);
        Self { tensors }
    }

    pub fn get(&self, key: &str) -> candle_core::Result<&Tensor> {
        self.tensors
            .get(key)
            .ok_or_else(|| candle_core::Error::Msg(format!("minibatch has no `{}`", key)))
    }

    /// The raw count tensor
    pub fn input(&self) -> candle_core::Result<&Tensor> {
        self.get(X_KEY)
    }

    /// Number of rows in the raw count tensor
    pub fn num_rows(&self) -> candle_core::Result<usize> {
        self.input()?.dim(0)
    }
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    /// Take the `batch_idx`-th shuffled minibatch
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    /// Take rows `[lb, ub)` in their original order
    fn minibatch_ordered(
        &self,
        lb: usize,
        ub: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_data(&self) -> usize;

    fn num_minibatch(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

///
/// A simple data loader for in-memory 2d matrix.  Each row will be
/// considered as a feature vector. The number of samples is the
/// number of rows.
///
pub struct InMemoryData {
    input_data: Vec<Tensor>,
    shuffled_input_data: Option<Vec<Tensor>>,
    minibatches: Minibatches,
}

impl InMemoryData {
    /// Create a data loader with the main data `data`
    pub fn new<D>(data: &D) -> anyhow::Result<Self>
    where
        D: RowsToTensorVec,
    {
        let input_data = data.rows_to_tensor_vec()?;
        if input_data.is_empty() {
            return Err(anyhow::anyhow!("empty data"));
        }
        let samples = (0..input_data.len()).collect();

        Ok(InMemoryData {
            input_data,
            shuffled_input_data: None,
            minibatches: Minibatches::new(samples),
        })
    }

    /// Make minibatch shuffling reproducible
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.minibatches.rng = Some(StdRng::seed_from_u64(seed));
        self
    }

    /// Number of columns (features)
    pub fn num_features(&self) -> anyhow::Result<usize> {
        Ok(self.input_data[0].dim(1)?)
    }

    /// Sample indexes of each minibatch after shuffling
    pub fn chunks(&self) -> &[Vec<usize>] {
        &self.minibatches.chunks
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        let shuffled = self
            .shuffled_input_data
            .as_ref()
            .ok_or(anyhow::anyhow!("need to shuffle data"))?;

        let x_nd = shuffled.get(batch_idx).ok_or(anyhow::anyhow!(
            "invalid index = {} vs. total # = {}",
            batch_idx,
            shuffled.len()
        ))?;

        Ok(MinibatchData::new(x_nd.to_device(target_device)?))
    }

    fn minibatch_ordered(
        &self,
        lb: usize,
        ub: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        if lb >= ub || ub > self.input_data.len() {
            return Err(anyhow::anyhow!(
                "check lb {}, ub {} vs. ntot {}",
                lb,
                ub,
                self.input_data.len()
            ));
        }
        let x_nd = Tensor::cat(&self.input_data[lb..ub], 0)?;
        Ok(MinibatchData::new(x_nd.to_device(target_device)?))
    }

    fn num_data(&self) -> usize {
        self.input_data.len()
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        if batch_size == 0 {
            return Err(anyhow::anyhow!("batch size must be positive"));
        }

        self.minibatches.shuffle_minibatch(batch_size);

        // preload all the shuffled data
        let shuffled = self
            .minibatches
            .chunks
            .iter()
            .map(|samples| {
                let chunk: Vec<Tensor> = samples
                    .iter()
                    .map(|&i| self.input_data[i].clone())
                    .collect();
                Tensor::cat(&chunk, 0)
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        self.shuffled_input_data = Some(shuffled);
        Ok(())
    }
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition indexes.
///
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
    rng: Option<StdRng>,
}

impl Minibatches {
    pub fn new(samples: Vec<usize>) -> Self {
        Self {
            samples,
            chunks: vec![],
            rng: None,
        }
    }

    /// Permute the samples and cut them into consecutive chunks of
    /// `batch_size`; only the last chunk may be smaller
    pub fn shuffle_minibatch(&mut self, batch_size: usize) {
        match self.rng.as_mut() {
            Some(rng) => self.samples.shuffle(rng),
            None => self.samples.shuffle(&mut rand::rng()),
        }

        self.chunks = self
            .samples
            .chunks(batch_size.max(1))
            .map(|c| c.to_vec())
            .collect();
    }
}

/// Split a matrix into one `1 x d` tensor per row
pub trait RowsToTensorVec {
    fn rows_to_tensor_vec(&self) -> candle_core::Result<Vec<Tensor>>;
}

impl RowsToTensorVec for Array2<f32> {
    fn rows_to_tensor_vec(&self) -> candle_core::Result<Vec<Tensor>> {
        let ncol = self.ncols();
        self.axis_iter(Axis(0))
            .into_par_iter()
            .map(|row| {
                Tensor::from_iter(row.iter().copied(), &Device::Cpu)?.reshape((1, ncol))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_counts(nrow: usize, ncol: usize) -> Array2<f32> {
        Array2::from_shape_fn((nrow, ncol), |(i, j)| (i * ncol + j) as f32)
    }

    #[test]
    fn test_shuffled_minibatches_partition_rows() -> anyhow::Result<()> {
        let mut data = InMemoryData::new(&toy_counts(23, 4))?.with_seed(3);
        data.shuffle_minibatch(5)?;
        assert_eq!(data.num_minibatch(), 5);

        let mut seen: Vec<usize> = data.chunks().iter().flatten().copied().collect();
        seen.sort();
        assert_eq!(seen, (0..23).collect::<Vec<_>>());

        let last = data.minibatch_data(4, &Device::Cpu)?;
        assert_eq!(last.input()?.dims(), &[3, 4]);
        Ok(())
    }

    #[test]
    fn test_minibatch_rows_match_source() -> anyhow::Result<()> {
        let counts = toy_counts(10, 3);
        let mut data = InMemoryData::new(&counts)?.with_seed(11);
        data.shuffle_minibatch(4)?;

        let chunk = data.chunks()[0].clone();
        let mb = data.minibatch_data(0, &Device::Cpu)?;
        let rows: Vec<Vec<f32>> = mb.input()?.to_vec2()?;
        for (r, &i) in rows.iter().zip(chunk.iter()) {
            assert_eq!(r, &counts.row(i).to_vec());
        }
        Ok(())
    }

    #[test]
    fn test_ordered_minibatch() -> anyhow::Result<()> {
        let counts = toy_counts(6, 2);
        let data = InMemoryData::new(&counts)?;
        let mb = data.minibatch_ordered(2, 5, &Device::Cpu)?;
        let rows: Vec<Vec<f32>> = mb.input()?.to_vec2()?;
        assert_eq!(rows, vec![vec![4., 5.], vec![6., 7.], vec![8., 9.]]);
        assert!(data.minibatch_ordered(5, 7, &Device::Cpu).is_err());
        assert!(data.minibatch_data(0, &Device::Cpu).is_err());
        Ok(())
    }

    #[test]
    fn test_missing_key() {
        let x = Tensor::zeros((2, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let mb = MinibatchData::new(x);
        assert!(mb.get(X_KEY).is_ok());
        assert!(mb.get("batch").is_err());
    }
}
