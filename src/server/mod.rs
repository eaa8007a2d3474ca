use crate::pipeline::PipelineError;
use actix_web::http::header::ContentType;
use actix_web::http::StatusCode;
use actix_web::{error, web, HttpRequest, HttpResponse};
use tracing::warn;

mod protocol;
pub mod routes;

pub use protocol::{FrameRequest, PlayRequest, PlayResponse, PredictResponse};
pub use routes::configure;

/// A request failure, rendered as `{"error": <message>}`
#[derive(Debug, thiserror::Error)]
pub enum WebError {
    /// The frame could not be decoded. The cause is logged, not returned
    #[error("Invalid image data")]
    InvalidImage,

    #[error("Invalid request body")]
    InvalidRequest,

    #[error("Request body too large")]
    PayloadTooLarge,

    #[error("Invalid opponent move")]
    InvalidOpponent,

    /// The model failed; its message is passed through
    #[error("{0}")]
    Inference(String),
}

impl error::ResponseError for WebError {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .insert_header(ContentType::json())
            .json(protocol::ErrorResponse {
                error: self.to_string(),
            })
    }

    fn status_code(&self) -> StatusCode {
        match self {
            WebError::InvalidImage | WebError::InvalidRequest | WebError::InvalidOpponent => {
                StatusCode::BAD_REQUEST
            }
            WebError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            WebError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PipelineError> for WebError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Decode(_) => WebError::InvalidImage,
            PipelineError::Inference(e) => WebError::Inference(e.to_string()),
        }
    }
}

impl From<error::BlockingError> for WebError {
    fn from(err: error::BlockingError) -> Self {
        WebError::Inference(err.to_string())
    }
}

/// JSON extractor settings shared by the frame endpoints. Body errors are
/// answered in the same shape as every other failure
pub fn json_config(limit: usize) -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(limit)
        .error_handler(|err, _req: &HttpRequest| {
            warn!("rejecting request body: {err}");
            match err {
                error::JsonPayloadError::Overflow { .. }
                | error::JsonPayloadError::OverflowKnownLength { .. } => {
                    WebError::PayloadTooLarge.into()
                }
                _ => WebError::InvalidRequest.into(),
            }
        })
}
