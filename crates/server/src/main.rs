use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use server_api::{finalize, ApiContext};
use shared::{
    domain::{GridGeometry, StaticLedger},
    error::{ApiError, ErrorCode, FailureBody},
    protocol::FinalizeRequest,
};
use storage::Storage;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, load_static_ledger, prepare_database_url, Settings};

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    storage: Storage,
    static_ledger: Arc<StaticLedger>,
}

/// Same headers on the preflight answer and on every finalize response.
const CORS_HEADERS: [(header::HeaderName, &str); 3] = [
    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
    (header::ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS"),
    (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let static_ledger = load_static_ledger(settings.static_ledger_path.as_deref())?;
    let state = build_state(&settings, storage, static_ledger);
    let app = build_router(Arc::new(state), settings.max_body_bytes);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(
        %addr,
        width = settings.grid_width,
        height = settings.grid_height,
        "server listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_state(settings: &Settings, storage: Storage, static_ledger: StaticLedger) -> AppState {
    let geometry = GridGeometry::new(settings.grid_width, settings.grid_height);
    let api = ApiContext::new(Arc::new(storage.clone()), geometry)
        .with_static_ledger(&static_ledger)
        .with_finalize_max_attempts(settings.finalize_max_attempts);
    AppState {
        api,
        storage,
        static_ledger: Arc::new(static_ledger),
    }
}

fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/finalize",
            post(http_finalize)
                .options(preflight)
                .fallback(method_not_allowed),
        )
        .route("/data/purchasedBlocks.json", get(http_static_ledger))
        // Enforced by the body extractor so oversized requests still get the
        // JSON failure envelope and CORS headers.
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    match state.storage.health_check().await {
        Ok(()) => "ok".into_response(),
        Err(error) => {
            warn!(%error, "healthz: storage ping failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable").into_response()
        }
    }
}

async fn preflight() -> impl IntoResponse {
    (StatusCode::NO_CONTENT, CORS_HEADERS)
}

async fn method_not_allowed() -> Response {
    failure(
        StatusCode::METHOD_NOT_ALLOWED,
        ApiError::new(ErrorCode::MethodNotAllowed, "use POST"),
    )
}

async fn http_static_ledger(State(state): State<Arc<AppState>>) -> Json<StaticLedger> {
    Json(state.static_ledger.as_ref().clone())
}

async fn http_finalize(
    State(state): State<Arc<AppState>>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!(status = %rejection.status(), "finalize: unreadable body");
            return failure(
                rejection.status(),
                ApiError::new(ErrorCode::InvalidRequestBody, rejection.body_text()),
            );
        }
    };

    let request = match parse_finalize_body(&body) {
        Ok(request) => request,
        Err(err) => return error_response(err),
    };

    match finalize(&state.api, request).await {
        Ok(success) => (StatusCode::OK, CORS_HEADERS, Json(success)).into_response(),
        Err(err) => error_response(err),
    }
}

/// JSON first; anything that is not JSON is read as a urlencoded form.
fn parse_finalize_body(body: &[u8]) -> Result<FinalizeRequest, ApiError> {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value @ serde_json::Value::Object(_)) => serde_json::from_value(value)
            .map_err(|e| ApiError::new(ErrorCode::InvalidRequestBody, e.to_string())),
        Ok(_) => Ok(FinalizeRequest::default()),
        Err(_) => Ok(parse_form_body(body)),
    }
}

fn parse_form_body(body: &[u8]) -> FinalizeRequest {
    let mut request = FinalizeRequest::default();
    for (key, value) in url::form_urlencoded::parse(body) {
        match key.as_ref() {
            "reservationId" => request.reservation_id = value.into_owned(),
            "imageUrl" => request.image_url = value.into_owned(),
            "linkUrl" => request.link_url = value.into_owned(),
            "name" => request.name = value.into_owned(),
            "blockIndex" | "blocksCsv" => request.block_index = value.into_owned(),
            "blocks" | "blocks[]" => request.blocks.extend(
                value
                    .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
                    .filter(|part| !part.is_empty())
                    .map(|part| serde_json::Value::String(part.to_string())),
            ),
            _ => {}
        }
    }
    request
}

fn error_response(err: ApiError) -> Response {
    let status =
        StatusCode::from_u16(err.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(code = %err.code, message = %err.message, "finalize: failed");
    } else {
        info!(code = %err.code, message = %err.message, "finalize: rejected");
    }
    failure(status, err)
}

fn failure(status: StatusCode, err: ApiError) -> Response {
    (status, CORS_HEADERS, Json(FailureBody::from(err))).into_response()
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
