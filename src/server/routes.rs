//! The user-facing JSON web server. Frames posted by the capture page are
//! decoded and classified on the blocking thread pool so that slow forward
//! passes never stall the async workers

use super::protocol::{FrameRequest, PlayRequest, PlayResponse, PredictResponse};
use super::WebError;
use crate::gesture::{Gesture, Outcome};
use crate::pipeline::Pipeline;
use actix_web::http::header::ContentType;
use actix_web::{get, post, web, HttpResponse, Responder};
use rand::seq::SliceRandom;
use tracing::info;

type Result<T> = std::result::Result<T, WebError>;

/// The built-in capture page
pub const INDEX_HTML: &str = include_str!("../../static/index.html");

/// The page served at `/`
#[derive(Debug, Clone)]
pub struct IndexPage(pub String);

impl Default for IndexPage {
    fn default() -> Self {
        IndexPage(INDEX_HTML.to_string())
    }
}

/// Register every route on an app or scope
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(index)
        .service(health)
        .service(predict)
        .service(play);
}

/// Classify a single frame
#[post("/predict")]
pub async fn predict(
    req: web::Json<FrameRequest>,
    state: web::Data<Pipeline>,
) -> Result<impl Responder> {
    let payload = req.into_inner().frame_data;
    let prediction = web::block(move || state.predict(&payload)).await??;

    info!("predicted {}", prediction.gesture);
    Ok(web::Json(PredictResponse::from(prediction)))
}

/// Classify a frame and play it against an opponent move
#[post("/play")]
pub async fn play(req: web::Json<PlayRequest>, state: web::Data<Pipeline>) -> Result<impl Responder> {
    let PlayRequest {
        frame_data,
        opponent,
    } = req.into_inner();

    let opponent = match opponent {
        Some(opponent) => opponent
            .parse::<Gesture>()
            .map_err(|_| WebError::InvalidOpponent)?,
        None => *Gesture::ALL
            .choose(&mut rand::thread_rng())
            .unwrap_or(&Gesture::Rock),
    };

    let prediction = web::block(move || state.predict(&frame_data)).await??;
    let outcome = Outcome::decide(prediction.gesture, opponent);

    info!(
        "played {} against {}: {:?}",
        prediction.gesture, opponent, outcome
    );
    Ok(web::Json(PlayResponse {
        prediction: prediction.gesture,
        opponent,
        outcome,
    }))
}

#[get("/health")]
pub async fn health() -> impl Responder {
    HttpResponse::Ok().body("ok")
}

#[get("/")]
pub async fn index(page: Option<web::Data<IndexPage>>) -> impl Responder {
    let body = match page {
        Some(page) => page.0.clone(),
        None => INDEX_HTML.to_string(),
    };
    HttpResponse::Ok().content_type(ContentType::html()).body(body)
}
