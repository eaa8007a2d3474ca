//! Maps a decoded frame to a gesture through an opaque [`Model`]

use crate::decoder::DecodedImage;
use crate::gesture::Gesture;
use std::sync::Arc;
use tracing::{debug, error};

/// A loaded network. Implementations must be safe to call from several
/// request threads at once, serializing internally if the runtime requires it
pub trait Model: Send + Sync {
    /// Run a single forward pass and return one score per class
    fn predict(&self, image: &DecodedImage) -> anyhow::Result<Vec<f32>>;
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("{0}")]
    Model(anyhow::Error),

    #[error("model returned {got} scores for {expected} labels")]
    ScoreLength { expected: usize, got: usize },

    #[error("model returned a non-finite score at index {index}")]
    NonFinite { index: usize },
}

/// Class names in model output order. Shared read-only by every request
#[derive(Debug, Clone, PartialEq)]
pub struct LabelTable(Arc<[Gesture]>);

impl LabelTable {
    pub fn new(labels: impl Into<Arc<[Gesture]>>) -> Self {
        Self(labels.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Gesture> {
        self.0.get(index).copied()
    }

    pub fn position(&self, gesture: Gesture) -> Option<usize> {
        self.0.iter().position(|g| *g == gesture)
    }

    pub fn iter(&self) -> impl Iterator<Item = Gesture> + '_ {
        self.0.iter().copied()
    }
}

impl Default for LabelTable {
    fn default() -> Self {
        Self::new(Gesture::ALL.to_vec())
    }
}

/// A classified frame
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub gesture: Gesture,
    pub index: usize,
    pub scores: Vec<f32>,
}

pub struct Classifier {
    model: Box<dyn Model>,
    labels: LabelTable,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Classifier {{ model: <dyn Model>, labels: {:?} }}", self.labels)
    }
}

impl Classifier {
    pub fn new(model: Box<dyn Model>, labels: LabelTable) -> Self {
        Self { model, labels }
    }

    /// Run the model once on `image` and pick the highest scoring label
    pub fn classify(&self, image: &DecodedImage) -> Result<Prediction, InferenceError> {
        let scores = self.model.predict(image).map_err(|e| {
            error!("model prediction failed: {e:#}");
            InferenceError::Model(e)
        })?;

        if scores.len() != self.labels.len() {
            error!(
                "score vector has {} entries, label table has {}",
                scores.len(),
                self.labels.len()
            );
            return Err(InferenceError::ScoreLength {
                expected: self.labels.len(),
                got: scores.len(),
            });
        }
        if let Some(index) = scores.iter().position(|s| !s.is_finite()) {
            error!("non-finite score in {scores:?}");
            return Err(InferenceError::NonFinite { index });
        }

        let index = argmax(&scores);
        let gesture = self
            .labels
            .get(index)
            .ok_or(InferenceError::ScoreLength {
                expected: self.labels.len(),
                got: scores.len(),
            })?;

        debug!("predicted {gesture} from scores {scores:?}");
        Ok(Prediction {
            gesture,
            index,
            scores,
        })
    }
}

/// Index of the largest score. Ties go to the lowest index
pub fn argmax(scores: &[f32]) -> usize {
    let mut best = 0;
    for (i, score) in scores.iter().enumerate().skip(1) {
        if *score > scores[best] {
            best = i;
        }
    }
    best
}
