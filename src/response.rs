use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

/// Standard JSON envelope returned by every administrative endpoint.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Shorthand for `200 OK` with the success envelope.
pub fn success<T: Serialize>(message: impl Into<String>, data: T) -> impl IntoResponse {
    Json(ApiResponse::success(message, data))
}

/// Shorthand for `201 Created` with the success envelope.
pub fn created<T: Serialize>(message: impl Into<String>, data: T) -> impl IntoResponse {
    (
        StatusCode::CREATED,
        Json(ApiResponse::success(message, data)),
    )
}

/// Error envelope with an explicit status code.
pub fn error(status: StatusCode, message: impl Into<String>) -> impl IntoResponse {
    (status, Json(ApiResponse::<()>::error(message)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_shape() {
        let resp = ApiResponse::success("ok", 42);
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["message"], "ok");
        assert_eq!(value["data"], 42);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn error_envelope_omits_data() {
        let resp = ApiResponse::<()>::error("boom");
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "boom");
        assert!(value.get("data").is_none());
    }
}
