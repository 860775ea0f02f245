//! Shared server state and request authentication

use crate::error::ApiError;
use axum::async_trait;
use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use callwire_core::auth::{Authenticator, Credentials};
use callwire_core::durable::{CallHistoryStore, ContactDirectory};
use callwire_core::orchestrator::CallOrchestrator;
use callwire_core::shutdown::ShutdownCoordinator;
use callwire_core::store::MemoryStore;
use callwire_core::transport::ConnectionHub;
use callwire_core::types::UserId;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: CallOrchestrator<MemoryStore>,
    pub hub: Arc<ConnectionHub>,
    pub auth: Arc<dyn Authenticator>,
    pub directory: Arc<dyn ContactDirectory>,
    pub history: Arc<dyn CallHistoryStore>,
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Header carrying a proxy-asserted user id
    pub user_header: String,
    pub history_limit: usize,
}

impl AppState {
    fn credentials(&self, parts: &Parts) -> Credentials {
        let bearer = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string())
            .or_else(|| {
                Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
                    .ok()
                    .and_then(|Query(mut params)| params.remove("token"))
            });

        let asserted_user = parts
            .headers
            .get(self.user_header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        Credentials { bearer, asserted_user }
    }
}

/// The authenticated user behind a request
#[derive(Debug, Clone)]
pub struct AuthUser(pub UserId);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let credentials = state.credentials(parts);
        let user = state.auth.authenticate(&credentials).await?;
        Ok(AuthUser(user))
    }
}
