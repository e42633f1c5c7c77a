use burn::tensor::cast::ToElement;
use burn::tensor::backend::Backend;
use std::time::Instant;
use tracing::info;

use crate::loss::SsdLosses;

/// Running means of the loss terms across steps.
pub struct LossStats {
    stopwatch: Instant,
    batch_size: usize,
    steps: usize,
    positive: f32,
    negative: f32,
    localization: f32,
}

impl LossStats {
    pub fn new(batch_size: usize) -> Self {
        LossStats {
            stopwatch: Instant::now(),
            batch_size,
            steps: 0,
            positive: 0.0,
            negative: 0.0,
            localization: 0.0,
        }
    }

    pub fn update<B: Backend>(&mut self, losses: &SsdLosses<B>) {
        self.positive += losses.positive.clone().into_scalar().to_f32();
        self.negative += losses.negative.clone().into_scalar().to_f32();
        self.localization += losses.localization.clone().into_scalar().to_f32();
        self.steps += 1;
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Mean `(positive, negative, localization)` since the last flush.
    pub fn means(&self) -> (f32, f32, f32) {
        if self.steps == 0 {
            return (0.0, 0.0, 0.0);
        }
        let n = self.steps as f32;
        (self.positive / n, self.negative / n, self.localization / n)
    }

    /// Logs the running means and resets.
    pub fn flush(&mut self, name: &str) {
        let (positive, negative, localization) = self.means();
        let elapsed = self.stopwatch.elapsed().as_secs();

        info!(
            name,
            images = self.steps * self.batch_size,
            positive,
            negative,
            localization,
            total = positive + negative + localization,
            "{}m{}s",
            elapsed / 60,
            elapsed % 60
        );

        self.stopwatch = Instant::now();
        self.steps = 0;
        self.positive = 0.0;
        self.negative = 0.0;
        self.localization = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{NdArray, ndarray::NdArrayDevice},
        tensor::Tensor,
    };
    use std::time::Duration;

    type B = NdArray<f32>;

    fn losses(p: f32, n: f32, l: f32) -> SsdLosses<B> {
        let device = &NdArrayDevice::default();
        SsdLosses {
            positive: Tensor::from_floats([p], device),
            negative: Tensor::from_floats([n], device),
            localization: Tensor::from_floats([l], device),
        }
    }

    #[test]
    fn test_update_averages() {
        let mut stats = LossStats::new(4);
        stats.update(&losses(1.0, 2.0, 3.0));
        stats.update(&losses(3.0, 4.0, 5.0));

        assert_eq!(stats.steps(), 2);
        assert_eq!(stats.means(), (2.0, 3.0, 4.0));
    }

    #[test]
    fn test_flush_resets() {
        let mut stats = LossStats::new(4);
        stats.update(&losses(1.0, 1.0, 1.0));
        stats.stopwatch = Instant::now() - Duration::from_secs(100);

        stats.flush("train");

        assert_eq!(stats.steps(), 0);
        assert_eq!(stats.means(), (0.0, 0.0, 0.0));
        assert!(stats.stopwatch.elapsed().as_secs() < 2);
    }
}
