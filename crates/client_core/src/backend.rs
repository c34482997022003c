use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ReservationId, StaticLedger},
    error::{ErrorCode, FailureBody},
    protocol::{
        FinalizeRequest, FinalizeSuccess, LockRequest, LockResponse, StatusResponse,
        UnlockRequest,
    },
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BackendError {
    /// The lock service refused because another visitor holds a requested cell.
    #[error("cells are held by someone else")]
    Conflict,
    #[error("server rejected request ({status}): {message}")]
    Rejected {
        status: u16,
        code: Option<ErrorCode>,
        message: String,
    },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Rejected { code, .. } => *code,
            _ => None,
        }
    }

    pub fn is_lock_not_found(&self) -> bool {
        self.code().is_some_and(ErrorCode::is_lock_not_found)
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::Decode(value.to_string())
        } else {
            Self::Transport(value.to_string())
        }
    }
}

/// The services a selection session talks to. Only finalize is owned by this
/// workspace; lock, unlock and status are external collaborators.
#[async_trait]
pub trait GridBackend: Send + Sync {
    async fn lock(&self, request: LockRequest) -> Result<LockResponse, BackendError>;
    async fn unlock(&self, reservation_id: &ReservationId) -> Result<(), BackendError>;
    async fn status(&self) -> Result<StatusResponse, BackendError>;
    async fn finalize(&self, request: FinalizeRequest) -> Result<FinalizeSuccess, BackendError>;
    async fn static_ledger(&self) -> Result<StaticLedger, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoints {
    pub lock: String,
    pub unlock: String,
    pub status: String,
    pub finalize: String,
    pub static_ledger: String,
}

impl Default for BackendEndpoints {
    fn default() -> Self {
        Self {
            lock: "/lock".into(),
            unlock: "/unlock".into(),
            status: "/status".into(),
            finalize: "/finalize".into(),
            static_ledger: "/data/purchasedBlocks.json".into(),
        }
    }
}

pub struct HttpGridBackend {
    http: Client,
    base_url: String,
    endpoints: BackendEndpoints,
}

impl HttpGridBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_endpoints(base_url, BackendEndpoints::default())
    }

    pub fn with_endpoints(base_url: impl Into<String>, endpoints: BackendEndpoints) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            endpoints,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl GridBackend for HttpGridBackend {
    async fn lock(&self, request: LockRequest) -> Result<LockResponse, BackendError> {
        let response = self
            .http
            .post(self.url(&self.endpoints.lock))
            .json(&request)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            debug!(blocks = request.blocks.len(), "backend: lock conflict");
            return Err(BackendError::Conflict);
        }
        read_json(response).await
    }

    async fn unlock(&self, reservation_id: &ReservationId) -> Result<(), BackendError> {
        let response = self
            .http
            .post(self.url(&self.endpoints.unlock))
            .json(&UnlockRequest {
                reservation_id: reservation_id.clone(),
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        Ok(())
    }

    async fn status(&self) -> Result<StatusResponse, BackendError> {
        let response = self
            .http
            .get(self.url(&self.endpoints.status))
            .send()
            .await?;
        read_json(response).await
    }

    async fn finalize(&self, request: FinalizeRequest) -> Result<FinalizeSuccess, BackendError> {
        let response = self
            .http
            .post(self.url(&self.endpoints.finalize))
            .json(&request)
            .send()
            .await?;
        read_json(response).await
    }

    async fn static_ledger(&self) -> Result<StaticLedger, BackendError> {
        let response = self
            .http
            .get(self.url(&self.endpoints.static_ledger))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        let raw = response.text().await?;
        StaticLedger::from_json(&raw).map_err(|e| BackendError::Decode(e.to_string()))
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
    if !response.status().is_success() {
        return Err(rejection(response).await);
    }
    let raw = response.bytes().await?;
    serde_json::from_slice(&raw).map_err(|e| BackendError::Decode(e.to_string()))
}

/// Turns a non-2xx answer into `Rejected`, keeping the error code when the
/// body is a failure envelope.
async fn rejection(response: Response) -> BackendError {
    let status = response.status().as_u16();
    let raw = response.text().await.unwrap_or_default();
    match serde_json::from_str::<FailureBody>(&raw) {
        Ok(body) => BackendError::Rejected {
            status,
            code: Some(body.error),
            message: body.message.unwrap_or_else(|| body.error.to_string()),
        },
        Err(_) => BackendError::Rejected {
            status,
            code: None,
            message: if raw.trim().is_empty() {
                format!("HTTP {status}")
            } else {
                raw
            },
        },
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
