use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Query, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{
    auth::IdentityBinder,
    error::{ErrorCode, RelayError},
};

/// Query parameter carrying the token for browser WebSocket clients, which
/// cannot set an `Authorization` header on the upgrade request.
pub const ACCESS_TOKEN_QUERY_PARAM: &str = "access_token";

/// Binds an [`crate::auth::Identity`] to the request or answers `401`.
pub async fn require_identity(
    State(binder): State<Arc<IdentityBinder>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = request_token(&request) else {
        return unauthorized_response("missing bearer token");
    };

    let identity = match binder.bind(&token).await {
        Ok(identity) => identity,
        Err(error) => return error.into_response(),
    };

    request.extensions_mut().insert(identity);

    next.run(request).await
}

fn request_token(request: &Request) -> Option<String> {
    let from_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .map(ToOwned::to_owned);
    if from_header.is_some() {
        return from_header;
    }

    let Query(params) = Query::<HashMap<String, String>>::try_from_uri(request.uri()).ok()?;
    params
        .get(ACCESS_TOKEN_QUERY_PARAM)
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn unauthorized_response(message: &'static str) -> Response {
    RelayError::new(ErrorCode::AuthInvalidToken, message).into_response()
}

#[cfg(test)]
mod tests {
    use super::{extract_bearer_token, require_identity};
    use crate::auth::{
        jwt::{JwtAccessTokenService, ACCESS_TOKEN_TTL_SECONDS},
        Identity, IdentityBinder,
    };
    use crate::store::UserStore;
    use axum::{
        body::Body,
        extract::Extension,
        http::{header::AUTHORIZATION, Request, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    const TEST_SECRET: &str = "huddle_test_secret_that_is_definitely_long_enough";

    fn jwt() -> JwtAccessTokenService {
        JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize")
    }

    fn protected_app() -> Router {
        let binder = Arc::new(IdentityBinder::new(jwt(), UserStore::in_memory()));
        Router::new()
            .route(
                "/protected",
                get(|Extension(identity): Extension<Identity>| async move {
                    format!("{}:{}", identity.user_id, identity.display_name)
                }),
            )
            .layer(middleware::from_fn_with_state(binder, require_identity))
    }

    async fn status_for(request: Request<Body>) -> StatusCode {
        protected_app().oneshot(request).await.expect("request should return a response").status()
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert_eq!(extract_bearer_token("bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("Basic abc"), None);
        assert_eq!(extract_bearer_token("Bearer   "), None);
    }

    #[tokio::test]
    async fn rejects_requests_without_token() {
        let request = Request::builder().uri("/protected").body(Body::empty()).unwrap();
        assert_eq!(status_for(request).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_requests_with_invalid_token() {
        let request = Request::builder()
            .uri("/protected")
            .header(AUTHORIZATION, "Bearer invalid-token")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_for(request).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn accepts_header_token() {
        let token =
            jwt().issue_user_token(Uuid::new_v4(), Some("Ada"), ACCESS_TOKEN_TTL_SECONDS).unwrap();
        let request = Request::builder()
            .uri("/protected")
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_for(request).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn accepts_query_token() {
        let token = jwt().issue_user_token(Uuid::new_v4(), None, ACCESS_TOKEN_TTL_SECONDS).unwrap();
        let request = Request::builder()
            .uri(format!("/protected?access_token={token}"))
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_for(request).await, StatusCode::OK);
    }
}
