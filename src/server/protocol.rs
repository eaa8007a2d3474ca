use crate::classifier::Prediction;
use crate::gesture::{Gesture, Outcome};
use serde::{Deserialize, Serialize};

/// A webcam frame posted by the capture page
#[derive(Deserialize)]
pub struct FrameRequest {
    pub frame_data: String,
}

impl std::fmt::Debug for FrameRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FrameRequest {{ frame_data: <{} bytes> }}",
            self.frame_data.len()
        )
    }
}

/// A frame plus the move it is played against. A random opponent move is
/// drawn when none is given
#[derive(Deserialize)]
pub struct PlayRequest {
    pub frame_data: String,
    pub opponent: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PredictResponse {
    pub prediction: Gesture,
}

impl From<Prediction> for PredictResponse {
    fn from(prediction: Prediction) -> Self {
        Self {
            prediction: prediction.gesture,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PlayResponse {
    pub prediction: Gesture,
    pub opponent: Gesture,
    pub outcome: Outcome,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
