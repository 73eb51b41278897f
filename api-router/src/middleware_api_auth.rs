use axum::{extract::Request, http::header, middleware::Next, response::Response};

use crate::error::ApiError;

/// Principal attached by the upstream verifier. The core trusts the gateway
/// to have validated the bearer token and resolved these identifiers.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub workspace_id: String,
    pub user_id: String,
}

const WORKSPACE_HEADER: &str = "x-workspace-id";
const USER_HEADER: &str = "x-user-id";

pub async fn api_auth(mut request: Request, next: Next) -> Result<Response, ApiError> {
    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());
    if bearer.is_none() {
        return Err(ApiError::Unauthenticated(
            "missing bearer token".to_string(),
        ));
    }

    let workspace_id = header_value(&request, WORKSPACE_HEADER);
    let user_id = header_value(&request, USER_HEADER);

    let (Some(workspace_id), Some(user_id)) = (workspace_id, user_id) else {
        return Err(ApiError::Unauthenticated(
            "missing principal context".to_string(),
        ));
    };

    request.extensions_mut().insert(AuthContext {
        workspace_id,
        user_id,
    });

    Ok(next.run(request).await)
}

fn header_value(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(String::from)
}
