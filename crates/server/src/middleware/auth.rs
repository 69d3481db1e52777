//! Bearer-token authentication with operator scopes.
//!
//! Writes require `workflows:write` / `jobs:write`; runs require
//! `workflows:run` / `jobs:run`. No token is 401, a token without the
//! needed scope is 403. `auth.disabled` (or `WEFT_AUTH_DISABLED`)
//! grants every scope, for tests and local development.

use crate::config::AppState;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use std::collections::HashSet;
use std::sync::Arc;

pub const SCOPE_WORKFLOWS_WRITE: &str = "workflows:write";
pub const SCOPE_WORKFLOWS_RUN: &str = "workflows:run";
pub const SCOPE_JOBS_WRITE: &str = "jobs:write";
pub const SCOPE_JOBS_RUN: &str = "jobs:run";

/// Authenticated operator attached to the request.
#[derive(Debug, Clone)]
pub struct OperatorIdentity {
    pub subject: String,
    pub scopes: HashSet<String>,
    pub all_scopes: bool,
}

impl OperatorIdentity {
    pub fn unrestricted(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            scopes: HashSet::new(),
            all_scopes: true,
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.all_scopes || self.scopes.contains(scope)
    }

    pub fn require(&self, scope: &str) -> Result<(), StatusCode> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            tracing::warn!(subject = %self.subject, scope, "insufficient scope");
            Err(StatusCode::FORBIDDEN)
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Resolve the request's operator identity against configured tokens.
pub fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<OperatorIdentity, StatusCode> {
    if state.config.auth.disabled {
        return Ok(OperatorIdentity::unrestricted("anonymous"));
    }

    let token = bearer_token(headers).ok_or(StatusCode::UNAUTHORIZED)?;
    let configured = state
        .config
        .auth
        .tokens
        .iter()
        .find(|t| t.token == token)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    Ok(OperatorIdentity {
        subject: configured.subject.clone(),
        scopes: configured.scopes.iter().cloned().collect(),
        all_scopes: false,
    })
}

/// Axum layer: authenticate and attach the identity as an extension.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let identity = authenticate(&state, request.headers())?;
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, OperatorToken, ServerConfig};
    use axum::http::HeaderValue;
    use tempfile::TempDir;

    fn state_with_auth(auth: AuthConfig) -> (TempDir, AppState) {
        let dir = TempDir::new().unwrap();
        let mut config =
            ServerConfig::load(&dir.path().join("weft.toml"), dir.path().to_path_buf()).unwrap();
        config.auth = auth;
        let state = AppState::new(config).unwrap();
        (dir, state)
    }

    fn headers_with(token: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            headers.insert(
                "Authorization",
                HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn missing_token_is_unauthorized() {
        let (_dir, state) = state_with_auth(AuthConfig {
            disabled: false,
            tokens: vec![],
        });
        assert_eq!(
            authenticate(&state, &headers_with(None)).unwrap_err(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn unknown_token_is_unauthorized() {
        let (_dir, state) = state_with_auth(AuthConfig {
            disabled: false,
            tokens: vec![OperatorToken {
                token: "real".to_string(),
                subject: "ops".to_string(),
                scopes: vec![SCOPE_WORKFLOWS_RUN.to_string()],
            }],
        });
        assert_eq!(
            authenticate(&state, &headers_with(Some("fake"))).unwrap_err(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn scopes_gate_writes() {
        let (_dir, state) = state_with_auth(AuthConfig {
            disabled: false,
            tokens: vec![OperatorToken {
                token: "runner".to_string(),
                subject: "runner-bot".to_string(),
                scopes: vec![SCOPE_WORKFLOWS_RUN.to_string()],
            }],
        });

        let identity = authenticate(&state, &headers_with(Some("runner"))).unwrap();
        assert!(identity.require(SCOPE_WORKFLOWS_RUN).is_ok());
        assert_eq!(
            identity.require(SCOPE_WORKFLOWS_WRITE).unwrap_err(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn disabled_auth_grants_everything() {
        let (_dir, state) = state_with_auth(AuthConfig {
            disabled: true,
            tokens: vec![],
        });
        let identity = authenticate(&state, &headers_with(None)).unwrap();
        assert!(identity.require(SCOPE_JOBS_WRITE).is_ok());
    }
}
