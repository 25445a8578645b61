pub mod health;
pub mod tokenize;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use llama_bridge::BridgeError;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::state::AppState;

/// The full service: every route, CORS, and shared state.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(health::router())
        .merge(tokenize::router())
        .layer(cors)
        .with_state(state)
}

//  Error response

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    message: String,
    r#type: &'static str,
}

/// A bridge error rendered as a JSON error body.
pub struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self.0 {
            BridgeError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
        };
        (
            status,
            Json(ErrorBody {
                error: ErrorDetail {
                    message: self.0.to_string(),
                    r#type: error_type,
                },
            }),
        )
            .into_response()
    }
}


#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::test_support::{body_json, call, get};

    #[tokio::test]
    async fn test_health_reports_ok() {
        let resp = call(get("/health")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["status"], "ok");
        assert_eq!(v["backend_initialized"], true);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let resp = call(get("/no/such/route")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_status_mapping() {
        use axum::response::IntoResponse;
        use llama_bridge::{BridgeError, Entity};

        let status = |e: BridgeError| super::ApiError::from(e).into_response().status();
        assert_eq!(status(BridgeError::InvalidArgument("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status(BridgeError::UseAfterRelease { entity: Entity::Model }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(status(BridgeError::NoLogitsAvailable), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
