//! Tokenization API: /api/tokenize, /api/tokenize/detokenize, /api/tokenize/info

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use llama_bridge::SpecialToken;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/tokenize", post(tokenize))
        .route("/api/tokenize/detokenize", post(detokenize))
        .route("/api/tokenize/info", get(info))
}

#[derive(Deserialize)]
struct TokenizeRequest {
    text: String,
    #[serde(default)]
    add_bos: bool,
    #[serde(default)]
    add_eos: bool,
}

#[derive(Serialize)]
struct TokenizeResponse {
    token_ids: Vec<i32>,
}

#[derive(Deserialize)]
struct DetokenizeRequest {
    token_ids: Vec<i32>,
}

#[derive(Serialize)]
struct DetokenizeResponse {
    text: String,
}

#[derive(Serialize)]
struct InfoResponse {
    vocabulary_size: usize,
    bos_token: Option<i32>,
    eos_token: Option<i32>,
}

async fn tokenize(
    State(state): State<AppState>,
    Json(req): Json<TokenizeRequest>,
) -> Result<Json<TokenizeResponse>, ApiError> {
    let token_ids = state
        .tokenizer()
        .tokenize_with(&req.text, req.add_bos, req.add_eos)?;
    debug!(n_tokens = token_ids.len(), "Tokenized");
    Ok(Json(TokenizeResponse { token_ids }))
}

async fn detokenize(
    State(state): State<AppState>,
    Json(req): Json<DetokenizeRequest>,
) -> Result<Json<DetokenizeResponse>, ApiError> {
    let text = state.tokenizer().detokenize(&req.token_ids)?;
    Ok(Json(DetokenizeResponse { text }))
}

async fn info(State(state): State<AppState>) -> Result<Json<InfoResponse>, ApiError> {
    let tokenizer = state.tokenizer();
    Ok(Json(InfoResponse {
        vocabulary_size: tokenizer.vocab_size()?,
        bos_token: tokenizer.special_token(SpecialToken::Bos)?,
        eos_token: tokenizer.special_token(SpecialToken::Eos)?,
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use llama_bridge::testing::{BOS, EOS, VOCAB_SIZE, byte_token};

    use crate::routes::test_support::{body_json, call, get, post_json};

    #[tokio::test]
    async fn test_tokenize_returns_ids() {
        let resp = call(post_json("/api/tokenize", r#"{"text":"hi"}"#)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(
            v["token_ids"],
            serde_json::json!([byte_token(b'h'), byte_token(b'i')])
        );
    }

    #[tokio::test]
    async fn test_tokenize_special_tokens() {
        let payload = r#"{"text":"a","add_bos":true,"add_eos":true}"#;
        let v = body_json(call(post_json("/api/tokenize", payload)).await).await;
        assert_eq!(v["token_ids"], serde_json::json!([BOS, byte_token(b'a'), EOS]));
    }

    #[tokio::test]
    async fn test_tokenize_bad_json_is_client_error() {
        let resp = call(post_json("/api/tokenize", "{not json}")).await;
        assert!(resp.status().is_client_error(), "got {}", resp.status());
    }

    #[tokio::test]
    async fn test_native_tokenizer_failure_is_500() {
        let resp = call(post_json("/api/tokenize", r#"{"text":"a\u0000b"}"#)).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let v = body_json(resp).await;
        assert_eq!(v["error"]["type"], "server_error");
    }

    #[tokio::test]
    async fn test_detokenize_returns_text() {
        let payload = serde_json::json!({
            "token_ids": [byte_token(b'o'), byte_token(b'k')]
        })
        .to_string();
        let resp = call(post_json("/api/tokenize/detokenize", &payload)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["text"], "ok");
    }

    #[tokio::test]
    async fn test_detokenize_out_of_vocab_is_400() {
        let payload = r#"{"token_ids":[5, 99999]}"#;
        let resp = call(post_json("/api/tokenize/detokenize", payload)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let v = body_json(resp).await;
        assert_eq!(v["error"]["type"], "invalid_request_error");
        assert!(v["error"]["message"].as_str().unwrap().contains("99999"));
    }

    #[tokio::test]
    async fn test_info_reports_vocabulary() {
        let resp = call(get("/api/tokenize/info")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["vocabulary_size"], VOCAB_SIZE);
        assert_eq!(v["bos_token"], BOS);
        assert_eq!(v["eos_token"], EOS);
    }
}
