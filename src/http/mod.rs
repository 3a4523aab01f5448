mod routes;
pub mod types;
mod macros;

use anyhow::{bail, Result};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use crate::config::HTTPConfig;
use crate::http::routes::*;
use crate::http::types::{HttpResponse, HttpState, JsonResult};
use crate::modem::sender::InterfaceSender;
use crate::modem::InterfaceRegistry;

pub(crate) async fn find_interface<T>(
    state: &HttpState,
    name: &str
) -> Result<InterfaceSender, (StatusCode, Json<HttpResponse<T>>)> {
    state.registry
        .find_by_name(name)
        .await
        .ok_or_else(|| HttpResponse::failure(StatusCode::NOT_FOUND, format!("No interface named {}", name)))
}

pub(crate) fn into_json_result<T>(result: Result<T>) -> JsonResult<T> {
    match result {
        Ok(data) => Ok(Json(HttpResponse {
            success: true,
            data: Some(data),
            error: None
        })),
        Err(e) => Err(HttpResponse::failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
    }
}

async fn auth_middleware(
    axum::extract::State(expected_token): axum::extract::State<String>,
    headers: axum::http::HeaderMap,
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next
) -> Result<axum::response::Response, StatusCode> {
    let auth_header = headers
        .get("authorization")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let auth_str = auth_header
        .to_str()
        .map_err(|_| StatusCode::BAD_REQUEST)?
        .trim();

    let token = auth_str.strip_prefix("Bearer ").unwrap_or(auth_str);
    if token != expected_token {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}

pub fn create_app(config: HTTPConfig, registry: InterfaceRegistry) -> Result<axum::Router> {
    let mut router = axum::Router::new()
        .route("/interfaces", get(list_interfaces))
        .route("/interfaces/{name}/status", get(interface_status))
        .route("/interfaces/{name}/dial", post(interface_dial))
        .route("/interfaces/{name}/answer", post(interface_answer))
        .route("/interfaces/{name}/hangup", post(interface_hangup))
        .route("/interfaces/{name}/dtmf", post(interface_dtmf))
        .route("/interfaces/{name}/sms", post(interface_send_sms))
        .route("/interfaces/{name}/ussd", post(interface_send_ussd))
        .layer(
            ServiceBuilder::new().layer(CorsLayer::permissive())
        );

    // Add optional authentication middleware.
    if config.require_authentication && config.token.is_none() {
        bail!("Missing required GSM_ENDPOINT_HTTP_TOKEN, and require_authentication is enabled");
    }
    if let Some(token) = config.token {
        info!("Adding HTTP authentication middleware!");
        router = router.layer(
            axum::middleware::from_fn_with_state(token, auth_middleware)
        );
    } else {
        warn!("Serving HTTP without authentication middleware due to missing GSM_ENDPOINT_HTTP_TOKEN");
    }

    Ok(router.with_state(HttpState { registry }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(token: Option<&str>) -> axum::Router {
        let (registry, _events) = InterfaceRegistry::new(Arc::new(AtomicBool::new(true)));
        let config = HTTPConfig {
            require_authentication: token.is_some(),
            token: token.map(str::to_string),
            ..HTTPConfig::default()
        };
        create_app(config, registry).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    // Success cases

    #[tokio::test]
    async fn test_list_interfaces() {
        let response = app(None)
            .oneshot(Request::get("/interfaces").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_bearer_token_accepted() {
        let request = Request::get("/interfaces")
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let response = app(Some("secret")).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // Failure cases

    #[tokio::test]
    async fn test_unknown_interface() {
        let request = Request::post("/interfaces/gsm9/dial")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"number":"123"}"#))
            .unwrap();
        let response = app(None).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "No interface named gsm9");
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let response = app(Some("secret"))
            .oneshot(Request::get("/interfaces").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::get("/interfaces")
            .header("authorization", "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        let response = app(Some("secret")).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_authentication_requires_token() {
        let (registry, _events) = InterfaceRegistry::new(Arc::new(AtomicBool::new(true)));
        let config = HTTPConfig {
            require_authentication: true,
            token: None,
            ..HTTPConfig::default()
        };
        assert!(create_app(config, registry).is_err());
    }
}
