//! Response helpers shared by the registry and gateway servers

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Response, StatusCode};
use serde::Serialize;

use super::BoxBody;
use crate::types::GatewayError;

/// Convert a Full<Bytes> body to BoxBody
pub fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

/// JSON response with the given status
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .header("Cache-Control", "no-store")
            .body(Full::new(Bytes::from(body)))
            .unwrap(),
        Err(e) => error_response(&GatewayError::from(e)),
    }
}

/// `{"error": kind, "message": text}` with the error's status
pub fn error_response(err: &GatewayError) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": err.kind(),
        "message": err.to_string(),
    });

    Response::builder()
        .status(err.status_code())
        .header("Content-Type", "application/json")
        .header("Cache-Control", "no-store")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

/// 404 for paths no handler owns
pub fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    error_response(&GatewayError::NotFound(format!("no handler for {}", path)))
}

pub fn method_not_allowed_response() -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": "MethodNotAllowed",
        "message": "method not allowed for this path",
    });

    Response::builder()
        .status(StatusCode::METHOD_NOT_ALLOWED)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

pub fn not_modified_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NOT_MODIFIED)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_body_shape() {
        let response = error_response(&GatewayError::NoInstanceAvailable("accounts".into()));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "NoInstanceAvailableError");
        assert!(json["message"].as_str().unwrap().contains("accounts"));
    }
}
