use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decode error: {0}")]
    ImageDecode(String),

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Meme not found: {id}")]
    MemeNotFound { id: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("File system error: {0}")]
    FileSystem(#[from] notify::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::ImageDecode(_) | AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::MemeNotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Io(_)
            | AppError::ImageProcessing(_)
            | AppError::Render(_)
            | AppError::Config(_)
            | AppError::Internal(_)
            | AppError::FileSystem(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_message = match &self {
            AppError::Io(_) => "Internal server error",
            AppError::ImageDecode(_) => "Unsupported or corrupt image",
            AppError::ImageProcessing(_) => "Image processing error",
            AppError::Render(_) => "Render error",
            AppError::Config(_) => "Configuration error",
            AppError::MemeNotFound { .. } => "Meme not found",
            AppError::InvalidRequest(_) => "Invalid request",
            AppError::Internal(_) => "Internal server error",
            AppError::FileSystem(_) => "File system error",
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "请求处理失败");
        }

        let body = Json(json!({
            "error": error_message,
            "message": self.to_string()
        }));

        (status, body).into_response()
    }
}

impl From<image::ImageError> for AppError {
    fn from(err: image::ImageError) -> Self {
        AppError::ImageProcessing(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_4xx() {
        assert_eq!(
            AppError::ImageDecode("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::InvalidRequest("too long".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::MemeNotFound { id: "abc".into() }.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn response_body_carries_error_and_message() {
        let response = AppError::MemeNotFound { id: "deadbeef".into() }.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "Meme not found");
        assert_eq!(value["message"], "Meme not found: deadbeef");
    }
}
