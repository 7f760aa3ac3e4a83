use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Postgres SQLSTATE for unique constraint violations.
const UNIQUE_VIOLATION: &str = "23505";

/// Coarse classification used by controllers to pick a transport status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Auth,
    NotFound,
    Conflict,
    BusinessRule,
    Dependency,
    Internal,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("forbidden: {0}")]
    Auth(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("business rule violated: {0}")]
    BusinessRule(String),
    #[error("{service} call failed{}: {message}", status_suffix(.status))]
    Dependency {
        service: &'static str,
        status: Option<u16>,
        message: String,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::Auth(_) => ErrorKind::Auth,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Conflict(_) => ErrorKind::Conflict,
            AppError::BusinessRule(_) => ErrorKind::BusinessRule,
            AppError::Dependency { .. } => ErrorKind::Dependency,
            AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn dependency(service: &'static str, message: impl Into<String>) -> Self {
        AppError::Dependency {
            service,
            status: None,
            message: message.into(),
        }
    }

    pub fn dependency_status(
        service: &'static str,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        AppError::Dependency {
            service,
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Auth => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::BusinessRule => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Dependency => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
                return AppError::Conflict(db_err.message().to_string());
            }
        }
        AppError::dependency("store", err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => AppError::dependency_status("http", status.as_u16(), err.to_string()),
            None => AppError::dependency("http", err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(?self);
        }
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Runs an adapter call under `limit`, surfacing expiry as a dependency failure.
pub async fn bounded<T, F>(service: &'static str, limit: Duration, call: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(AppError::dependency(
            service,
            format!("timed out after {}ms", limit.as_millis()),
        )),
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" with status {code}"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_transport_status() {
        assert_eq!(
            AppError::Validation("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppError::Auth("nope".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::Conflict("dup".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::dependency("payments", "down").status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn dependency_message_carries_upstream_status() {
        let err = AppError::dependency_status("provisioning", 503, "unavailable");
        assert_eq!(
            err.to_string(),
            "provisioning call failed with status 503: unavailable"
        );
        assert_eq!(err.kind(), ErrorKind::Dependency);

        let err = AppError::dependency("payments", "timed out");
        assert_eq!(err.to_string(), "payments call failed: timed out");
    }

    #[tokio::test]
    async fn bounded_call_times_out_as_dependency() {
        let err = bounded("provisioning", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, AppError>(())
        })
        .await
        .expect_err("call should time out");
        assert!(matches!(
            err,
            AppError::Dependency {
                service: "provisioning",
                status: None,
                ..
            }
        ));
    }

    #[test]
    fn response_uses_kind_status() {
        let response = AppError::NotFound("server".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
