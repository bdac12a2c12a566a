//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::service::deployment_service::DeploymentError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    BadGateway(String),
    DatabaseError(sqlx::Error),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::BadGateway(msg) => {
                tracing::warn!("Upstream error: {}", msg);
                (StatusCode::BAD_GATEWAY, msg)
            }
            ApiError::DatabaseError(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::DatabaseError(err)
    }
}

impl From<DeploymentError> for ApiError {
    fn from(err: DeploymentError) -> Self {
        match err {
            DeploymentError::NotFound(msg) => ApiError::NotFound(msg),
            DeploymentError::ValidationError(msg) => ApiError::BadRequest(msg),
            DeploymentError::Rejected(err) => ApiError::InternalError(err.status_message()),
            DeploymentError::Internal(msg) => ApiError::InternalError(msg),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_error_renders_json_body() {
        let response = ApiError::BadGateway("connection refused".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "connection refused");
    }

    #[test]
    fn test_database_error_is_opaque() {
        let response = ApiError::from(sqlx::Error::RowNotFound).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_config_invalid_maps_to_bad_request() {
        let err = DeploymentError::from(slipway_runner::DeployError::ConfigInvalid(
            "run x is already in progress".to_string(),
        ));
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
