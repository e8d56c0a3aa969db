//! HTTP surface: health, URL prediction and inline base64 prediction.

use std::future::Future;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;

use crate::classifier::{ClassifierError, ImagePredictor, PredictionResult};
use crate::fetch::{decode_base64_image, ImageFetcher};
use crate::model_store::ModelState;

pub const SERVICE_NAME: &str = "ml-background-classifier";

/// Headroom on top of the encoded image for the JSON envelope.
const BODY_OVERHEAD: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub api_token: String,
    /// Serve `/predict-base64` without the bearer check
    pub public_base64: bool,
}

#[derive(Clone)]
struct AppState {
    predictor: Arc<dyn ImagePredictor>,
    fetcher: ImageFetcher,
    api_token: Arc<str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PredictUrlRequest {
    image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PredictBase64Request {
    image_data: Option<String>,
}

enum ApiError {
    MissingAuthorization,
    InvalidToken,
    MissingField(&'static str),
    Rejected(JsonRejection),
    Prediction(ClassifierError),
    TaskFailed(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::MissingAuthorization => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "Authorization header is required" }),
            ),
            Self::InvalidToken => (StatusCode::FORBIDDEN, json!({ "error": "Invalid API token" })),
            Self::MissingField(field) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": format!("{} is required", field) }),
            ),
            Self::Rejected(rejection) => (
                rejection.status(),
                json!({ "error": "Invalid request body", "details": rejection.body_text() }),
            ),
            Self::Prediction(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Prediction failed", "details": err.to_string() }),
            ),
            Self::TaskFailed(details) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Prediction failed", "details": details }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

/// Builds the service router around `predictor`.
pub fn router(
    predictor: Arc<dyn ImagePredictor>,
    fetcher: ImageFetcher,
    options: ServerOptions,
) -> Router {
    // Base64 inflates the payload by a third.
    let body_limit = fetcher.max_bytes() / 3 * 4 + BODY_OVERHEAD;
    let state = AppState {
        predictor,
        fetcher,
        api_token: Arc::from(options.api_token),
    };

    let mut public = Router::new().route("/health", get(health));
    let mut protected = Router::new().route("/predict", post(predict_url));
    if options.public_base64 {
        public = public.route("/predict-base64", post(predict_base64));
    } else {
        protected = protected.route("/predict-base64", post(predict_base64));
    }
    let protected =
        protected.route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    public
        .merge(protected)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Runs `app` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}

async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let authorized = match presented_token(request.headers()) {
        Ok(token) => tokens_match(token, &state.api_token),
        Err(e) => return e.into_response(),
    };
    if !authorized {
        warn!("Rejected request with invalid API token");
        return ApiError::InvalidToken.into_response();
    }
    next.run(request).await
}

async fn health(State(state): State<AppState>) -> Response {
    let info = state.predictor.info();
    let (status, label) = match info.model_state {
        ModelState::Ready => (StatusCode::OK, "healthy"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
    };
    let body = json!({
        "status": label,
        "service": SERVICE_NAME,
        "modelState": info.model_state,
        "completedInferences": info.completed_inferences,
        "memory": info.memory,
    });
    (status, Json(body)).into_response()
}

async fn predict_url(
    State(state): State<AppState>,
    payload: Result<Json<PredictUrlRequest>, JsonRejection>,
) -> Result<Json<PredictionResult>, ApiError> {
    let request = json_body(payload, "imageUrl")?;
    let image_url = request
        .image_url
        .filter(|url| !url.is_empty())
        .ok_or(ApiError::MissingField("imageUrl"))?;

    info!("Processing image: {}", image_url);
    let bytes = state.fetcher.fetch(&image_url).await.map_err(|e| {
        error!("Prediction failed: {}", e);
        ApiError::Prediction(e.into())
    })?;

    run_prediction(state.predictor, bytes).await.map(Json)
}

async fn predict_base64(
    State(state): State<AppState>,
    payload: Result<Json<PredictBase64Request>, JsonRejection>,
) -> Result<Json<PredictionResult>, ApiError> {
    let request = json_body(payload, "imageData")?;
    let image_data = request
        .image_data
        .filter(|data| !data.is_empty())
        .ok_or(ApiError::MissingField("imageData"))?;

    let bytes = decode_base64_image(&image_data, state.fetcher.max_bytes()).map_err(|e| {
        error!("Prediction failed: {}", e);
        ApiError::Prediction(e)
    })?;

    run_prediction(state.predictor, bytes).await.map(Json)
}

async fn run_prediction(
    predictor: Arc<dyn ImagePredictor>,
    bytes: Vec<u8>,
) -> Result<PredictionResult, ApiError> {
    let outcome = tokio::task::spawn_blocking(move || predictor.predict(&bytes))
        .await
        .map_err(|e| {
            error!("Prediction task aborted: {}", e);
            ApiError::TaskFailed(e.to_string())
        })?;

    match outcome {
        Ok(result) => {
            info!(
                "Prediction result: {} (confidence {:.3}, remove {:.3}, keep {:.3})",
                result.decision, result.confidence, result.scores.remove, result.scores.keep
            );
            Ok(result)
        }
        Err(e) => {
            error!("Prediction failed: {}", e);
            Err(ApiError::Prediction(e))
        }
    }
}

/// A body sent without a JSON content type reads as empty, so the required
/// field is reported missing.
fn json_body<T>(
    payload: Result<Json<T>, JsonRejection>,
    field: &'static str,
) -> Result<T, ApiError> {
    match payload {
        Ok(Json(body)) => Ok(body),
        Err(JsonRejection::MissingJsonContentType(_)) => Err(ApiError::MissingField(field)),
        Err(rejection) => Err(ApiError::Rejected(rejection)),
    }
}

/// An absent or blank header counts as missing.
fn presented_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(AUTHORIZATION)
        .map(HeaderValue::as_bytes)
        .unwrap_or_default();
    if value.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::MissingAuthorization);
    }
    let value = std::str::from_utf8(value).map_err(|_| ApiError::InvalidToken)?;
    Ok(bearer_token(value.trim()))
}

fn bearer_token(header: &str) -> &str {
    header.strip_prefix("Bearer ").unwrap_or(header)
}

/// Compares in time independent of where the inputs first differ.
fn tokens_match(given: &str, expected: &str) -> bool {
    let (given, expected) = (given.as_bytes(), expected.as_bytes());
    if given.len() != expected.len() {
        return false;
    }
    given.iter().zip(expected).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_prefix_is_optional() {
        assert_eq!(bearer_token("Bearer abc"), "abc");
        assert_eq!(bearer_token("abc"), "abc");
        assert_eq!(bearer_token("bearer abc"), "bearer abc");
    }

    #[test]
    fn test_blank_authorization_is_missing() {
        let mut headers = HeaderMap::new();
        assert!(matches!(presented_token(&headers), Err(ApiError::MissingAuthorization)));

        headers.insert(AUTHORIZATION, HeaderValue::from_static(""));
        assert!(matches!(presented_token(&headers), Err(ApiError::MissingAuthorization)));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("   "));
        assert!(matches!(presented_token(&headers), Err(ApiError::MissingAuthorization)));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert!(matches!(presented_token(&headers), Ok("abc")));
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("secret", "secret"));
        assert!(!tokens_match("secreT", "secret"));
        assert!(!tokens_match("secret2", "secret"));
        assert!(!tokens_match("", "secret"));
    }

    #[test]
    fn test_error_statuses() {
        let status = |e: ApiError| e.into_response().status();
        assert_eq!(status(ApiError::MissingAuthorization), StatusCode::UNAUTHORIZED);
        assert_eq!(status(ApiError::InvalidToken), StatusCode::FORBIDDEN);
        assert_eq!(status(ApiError::MissingField("imageUrl")), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::Prediction(ClassifierError::ImageDecodeError("bad".into()))
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
