//! Axum route handlers for payment-gated resources.
//!
//! A proof travels either base64-encoded in the `Payment-Proof` header of a
//! `GET`, or as the JSON body of a `POST .../access`. Challenges and receipts
//! are mirrored into the `Payment-Required` and `Payment-Response` headers.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use m402::encoding::Base64Bytes;
use m402::gateway::{AccessGateway, AccessOutcome, Authorization, ResourceData};
use m402::proto::{AccessReceipt, PaymentChallenge, PaymentProof, PaymentRequired};
use serde::Serialize;

use crate::error::ServerError;

/// Request header carrying a base64 JSON [`PaymentProof`].
pub const PAYMENT_PROOF_HEADER: &str = "payment-proof";

/// Response header carrying a base64 JSON challenge envelope.
pub const PAYMENT_REQUIRED_HEADER: &str = "payment-required";

/// Response header carrying a base64 JSON [`AccessReceipt`].
pub const PAYMENT_RESPONSE_HEADER: &str = "payment-response";

/// Shared application state.
pub type AppState = Arc<AccessGateway>;

/// Encodes a value as base64 JSON for a header.
fn encode_header<T: Serialize>(value: &T) -> Result<HeaderValue, ServerError> {
    let json = serde_json::to_vec(value).map_err(|e| ServerError::Encoding(e.to_string()))?;
    HeaderValue::from_str(&Base64Bytes(json).encode())
        .map_err(|e| ServerError::Encoding(e.to_string()))
}

/// Decodes a `Payment-Proof` header value.
fn decode_proof_header(value: &HeaderValue) -> Result<PaymentProof, ServerError> {
    let text = value
        .to_str()
        .map_err(|_| ServerError::MalformedProof("header is not ASCII".to_owned()))?;
    let bytes = Base64Bytes::decode(text.trim())
        .map_err(|e| ServerError::MalformedProof(format!("header is not base64: {e}")))?;
    parse_proof(bytes.as_slice())
}

fn parse_proof(json: &[u8]) -> Result<PaymentProof, ServerError> {
    serde_json::from_slice(json).map_err(|e| ServerError::MalformedProof(e.to_string()))
}

/// Renders a 402 challenge with the envelope mirrored into a header.
fn challenge_response(required: &PaymentRequired) -> Result<Response, ServerError> {
    let header = encode_header(required)?;
    Ok((
        StatusCode::PAYMENT_REQUIRED,
        [(PAYMENT_REQUIRED_HEADER, header)],
        Json(required),
    )
        .into_response())
}

/// Renders a payload with its declared MIME type.
fn payload_response(data: ResourceData) -> Result<Response, ServerError> {
    let mime = HeaderValue::from_str(&data.mime_type)
        .map_err(|e| ServerError::Encoding(e.to_string()))?;
    let body = match data.content {
        serde_json::Value::String(text) if !data.mime_type.contains("json") => text.into_bytes(),
        content => {
            serde_json::to_vec(&content).map_err(|e| ServerError::Encoding(e.to_string()))?
        }
    };
    Ok(([(CONTENT_TYPE, mime)], body).into_response())
}

/// Runs the gateway with ledger access on the blocking pool.
///
/// Consuming a payment in a durable ledger waits for a disk flush, which must
/// not stall the async workers.
async fn redeem(
    gateway: AppState,
    resource_id: String,
    proof: Option<PaymentProof>,
) -> Result<AccessOutcome, ServerError> {
    let authorizer = Arc::clone(&gateway);
    let id = resource_id.clone();
    let authorization =
        tokio::task::spawn_blocking(move || authorizer.authorize(&id, proof.as_ref()))
            .await
            .map_err(|e| ServerError::Task(e.to_string()))??;

    Ok(match authorization {
        Authorization::Granted(grant) => gateway.deliver(&resource_id, grant).await?,
        Authorization::PaymentRequired(required) => AccessOutcome::PaymentRequired(required),
        Authorization::Rejected(rejection) => AccessOutcome::Rejected(rejection),
    })
}

/// `GET /resources/{resource_id}` - Challenge, or payload for a valid proof.
///
/// # Errors
///
/// Returns 400 for an undecodable proof, 402 for a rejected proof, 404 for
/// an unknown resource and 503 when the payment ledger is unavailable.
pub async fn get_resource(
    State(gateway): State<AppState>,
    Path(resource_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let proof = headers
        .get(PAYMENT_PROOF_HEADER)
        .map(decode_proof_header)
        .transpose()?;

    match redeem(gateway, resource_id, proof).await? {
        AccessOutcome::PaymentRequired(required) => challenge_response(&required),
        AccessOutcome::Granted { grant, data } => {
            let receipt = encode_header(&AccessReceipt::from(&grant))?;
            let mut response = payload_response(data)?;
            response
                .headers_mut()
                .insert(PAYMENT_RESPONSE_HEADER, receipt);
            Ok(response)
        }
        AccessOutcome::Rejected(err) => Err(err.into()),
    }
}

/// Body returned by [`post_access`] on a grant.
#[derive(Debug, Serialize)]
pub struct AccessGranted {
    /// The consumed payment.
    pub receipt: AccessReceipt,
    /// The resource payload.
    pub data: serde_json::Value,
}

/// `POST /resources/{resource_id}/access` - Redeems a JSON proof body.
///
/// Without a body the challenge is returned, as for `GET`.
///
/// # Errors
///
/// Same as [`get_resource`].
pub async fn post_access(
    State(gateway): State<AppState>,
    Path(resource_id): Path<String>,
    body: Bytes,
) -> Result<Response, ServerError> {
    let proof = if body.is_empty() {
        None
    } else {
        Some(parse_proof(&body)?)
    };

    match redeem(gateway, resource_id, proof).await? {
        AccessOutcome::PaymentRequired(required) => challenge_response(&required),
        AccessOutcome::Granted { grant, data } => {
            let receipt = AccessReceipt::from(&grant);
            let header = encode_header(&receipt)?;
            Ok((
                [(PAYMENT_RESPONSE_HEADER, header)],
                Json(AccessGranted {
                    receipt,
                    data: data.content,
                }),
            )
                .into_response())
        }
        AccessOutcome::Rejected(err) => Err(err.into()),
    }
}

/// `GET /resources` - Challenges for every registered resource.
pub async fn list_resources(State(gateway): State<AppState>) -> Json<Vec<PaymentChallenge>> {
    Json(gateway.challenges().all())
}

/// `GET /payments/consumed/count` - Number of consumed payments.
///
/// # Errors
///
/// Returns 503 when the payment ledger is unavailable.
pub async fn consumed_count(
    State(gateway): State<AppState>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let count = gateway.consumed_payment_count()?;
    Ok(Json(serde_json::json!({ "count": count })))
}

/// `GET /health` - Liveness probe.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /info` - Service name, version and registered resources.
pub async fn info(State(gateway): State<AppState>) -> Json<serde_json::Value> {
    let resources: Vec<String> = gateway
        .challenges()
        .all()
        .into_iter()
        .map(|c| c.resource_id)
        .collect();
    Json(serde_json::json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "resources": resources,
    }))
}

/// Creates an Axum [`axum::Router`] with all endpoints.
///
/// Endpoints:
/// - `GET /resources` - list challenges
/// - `GET /resources/{resource_id}` - challenge or header-proof access
/// - `POST /resources/{resource_id}/access` - body-proof access
/// - `GET /payments/consumed/count` - consumed payment count
/// - `GET /health` - liveness
/// - `GET /info` - service description
pub fn router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/resources", axum::routing::get(list_resources))
        .route("/resources/{resource_id}", axum::routing::get(get_resource))
        .route(
            "/resources/{resource_id}/access",
            axum::routing::post(post_access),
        )
        .route("/payments/consumed/count", axum::routing::get(consumed_count))
        .route("/health", axum::routing::get(health))
        .route("/info", axum::routing::get(info))
        .with_state(state)
}
