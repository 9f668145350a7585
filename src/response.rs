use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

/// Uniform JSON body returned by every auth endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub success: bool,
    pub message: String,
    pub object: Option<Value>,
    pub errors: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Envelope,
}

impl ApiResponse {
    pub fn ok(message: &str) -> Self {
        Self {
            status: StatusCode::OK,
            body: Envelope {
                success: true,
                message: message.into(),
                object: None,
                errors: None,
            },
        }
    }

    pub fn ok_with<T: Serialize>(message: &str, object: &T) -> Self {
        let object = match serde_json::to_value(object) {
            Ok(v) => Some(v),
            Err(e) => {
                error!(error = %e, "serialize response object failed");
                None
            }
        };
        let mut resp = Self::ok(message);
        resp.body.object = object;
        resp
    }

    pub fn error(status: StatusCode, message: &str, errors: Vec<String>) -> Self {
        Self {
            status,
            body: Envelope {
                success: false,
                message: message.into(),
                object: None,
                errors: Some(errors),
            },
        }
    }
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_always_carries_all_fields() {
        let json = serde_json::to_value(&ApiResponse::ok("done").body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "success": true,
                "message": "done",
                "object": null,
                "errors": null,
            })
        );
    }

    #[test]
    fn error_envelope_lists_messages() {
        let resp = ApiResponse::error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Validation failed.",
            vec!["a".into(), "b".into()],
        );
        assert_eq!(resp.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(!resp.body.success);
        assert_eq!(resp.body.errors.as_deref(), Some(&["a".to_string(), "b".to_string()][..]));
    }
}
