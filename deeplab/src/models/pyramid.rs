use std::collections::BTreeMap;

use burn::prelude::*;

use crate::error::{DeepLabError, DeepLabResult};

/// Feature maps keyed by pyramid level. Level `L` has stride `2^L` relative
/// to the image, so smaller keys are finer.
///
/// Never empty.
#[derive(Debug, Clone)]
pub struct FeaturePyramid<B: Backend> {
    levels: BTreeMap<usize, Tensor<B, 4>>,
}

impl<B: Backend> FeaturePyramid<B> {
    /// Wrap a level mapping.
    ///
    /// # Errors
    ///
    /// Returns [`DeepLabError::InvalidHeadInput`] when `levels` is empty.
    pub fn new(levels: BTreeMap<usize, Tensor<B, 4>>) -> DeepLabResult<Self> {
        if levels.is_empty() {
            return Err(DeepLabError::InvalidHeadInput {
                reason: "feature pyramid must contain at least one level".to_string(),
            });
        }
        Ok(Self { levels })
    }

    /// A pyramid holding a single feature map.
    pub fn single(level: usize, features: Tensor<B, 4>) -> Self {
        Self {
            levels: BTreeMap::from([(level, features)]),
        }
    }

    /// The level with the numerically smallest key and its feature map.
    pub fn finest(&self) -> (usize, &Tensor<B, 4>) {
        self.levels
            .iter()
            .next()
            .map(|(level, features)| (*level, features))
            .expect("FeaturePyramid is never empty")
    }

    /// Consume the pyramid, returning the finest feature map.
    pub fn into_finest(mut self) -> Tensor<B, 4> {
        self.levels
            .pop_first()
            .map(|(_, features)| features)
            .expect("FeaturePyramid is never empty")
    }

    pub fn get(&self, level: usize) -> Option<&Tensor<B, 4>> {
        self.levels.get(&level)
    }

    pub fn levels(&self) -> impl Iterator<Item = usize> + '_ {
        self.levels.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

impl<B: Backend> TryFrom<BTreeMap<usize, Tensor<B, 4>>> for FeaturePyramid<B> {
    type Error = DeepLabError;

    fn try_from(levels: BTreeMap<usize, Tensor<B, 4>>) -> Result<Self, Self::Error> {
        Self::new(levels)
    }
}
