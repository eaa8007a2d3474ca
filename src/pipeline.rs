//! The pipeline runs one frame through decoding and classification. It owns
//! the decoder and the loaded classifier and is shared by every request

use crate::classifier::{Classifier, InferenceError, LabelTable, Model, Prediction};
use crate::decoder::{DecodeError, ImageDecoder};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid image data: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Inference(#[from] InferenceError),
}

#[derive(Debug)]
pub struct Pipeline {
    decoder: ImageDecoder,
    classifier: Classifier,
}

impl Pipeline {
    pub fn new(decoder: ImageDecoder, classifier: Classifier) -> Self {
        Self {
            decoder,
            classifier,
        }
    }

    /// A pipeline over `model` with the default label order
    pub fn with_model(decoder: ImageDecoder, model: Box<dyn Model>) -> Self {
        Self::new(decoder, Classifier::new(model, LabelTable::default()))
    }

    /// Decode `payload` and classify it. The model is not consulted when the
    /// payload fails to decode
    pub fn predict(&self, payload: &str) -> Result<Prediction, PipelineError> {
        let image = self.decoder.decode(payload)?;
        Ok(self.classifier.classify(&image)?)
    }
}
