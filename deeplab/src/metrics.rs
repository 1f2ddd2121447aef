//! Mean intersection-over-union for multi-class segmentation.
//!
//! Intersections and unions are accumulated per class over the whole epoch;
//! the reported value is the mean IoU over the classes that appeared in a
//! prediction or a target.

use std::marker::PhantomData;

use burn::{
    prelude::*,
    tensor::ElementConversion,
    train::metric::{Metric, MetricEntry, MetricMetadata, Numeric},
};

/// Input for [`MeanIoUMetric`].
#[derive(Debug, Clone)]
pub struct MeanIoUInput<B: Backend> {
    /// Class scores or probabilities `[batch_size, num_classes, height, width]`
    pub predictions: Tensor<B, 4>,
    /// Class indices `[batch_size, height, width]`
    pub targets: Tensor<B, 3, Int>,
}

impl<B: Backend> MeanIoUInput<B> {
    pub const fn new(predictions: Tensor<B, 4>, targets: Tensor<B, 3, Int>) -> Self {
        Self {
            predictions,
            targets,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MeanIoUState {
    intersections: Vec<u64>,
    unions: Vec<u64>,
}

impl MeanIoUState {
    fn mean(&self) -> f64 {
        let ious: Vec<f64> = self
            .intersections
            .iter()
            .zip(&self.unions)
            .filter(|(_, union)| **union > 0)
            .map(|(&intersection, &union)| intersection as f64 / union as f64)
            .collect();

        if ious.is_empty() {
            0.0
        } else {
            ious.iter().sum::<f64>() / ious.len() as f64
        }
    }
}

/// Epoch-level mean IoU.
#[derive(Debug, Clone)]
pub struct MeanIoUMetric<B: Backend> {
    state: MeanIoUState,
    _b: PhantomData<B>,
}

impl<B: Backend> Default for MeanIoUMetric<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> MeanIoUMetric<B> {
    pub fn new() -> Self {
        Self {
            state: MeanIoUState::default(),
            _b: PhantomData,
        }
    }

    fn update_stats(&mut self, predictions: Tensor<B, 4>, targets: Tensor<B, 3, Int>) {
        let [batch_size, num_classes, height, width] = predictions.dims();
        let predicted = predictions.argmax(1).reshape([batch_size, height, width]);

        if self.state.intersections.len() < num_classes {
            self.state.intersections.resize(num_classes, 0);
            self.state.unions.resize(num_classes, 0);
        }

        for class in 0..num_classes {
            let predicted_class = predicted.clone().equal_elem(class as i64).int();
            let target_class = targets.clone().equal_elem(class as i64).int();

            let intersection = (predicted_class.clone() * target_class.clone())
                .sum()
                .into_scalar()
                .elem::<i64>();
            let total = (predicted_class.sum() + target_class.sum())
                .into_scalar()
                .elem::<i64>();

            self.state.intersections[class] += intersection as u64;
            self.state.unions[class] += (total - intersection) as u64;
        }
    }
}

impl<B: Backend> Metric for MeanIoUMetric<B> {
    type Input = MeanIoUInput<B>;

    fn name(&self) -> String {
        "Mean IoU".to_string()
    }

    fn update(&mut self, item: &Self::Input, _metadata: &MetricMetadata) -> MetricEntry {
        self.update_stats(item.predictions.clone(), item.targets.clone());
        let value = self.state.mean();
        MetricEntry::new(self.name(), format!("{value:.5}"), format!("{value:.5}"))
    }

    fn clear(&mut self) {
        self.state = MeanIoUState::default();
    }
}

impl<B: Backend> Numeric for MeanIoUMetric<B> {
    fn value(&self) -> f64 {
        self.state.mean()
    }
}
