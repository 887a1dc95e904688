// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP error responses
//!
//! Every handler error becomes `{"error": "<message>"}` with a matching
//! status code. Internal failures get a reference code that is logged with
//! the full details; the response carries only the code. Paths are
//! redacted from anything that is shown to the user.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::Serialize;

use crate::download::files::FileError;
use crate::download::DownloadError;

// =============================================================================
// ERROR REFERENCE CODE GENERATION
// =============================================================================

/// Generate a unique error reference code.
/// Format: ERR-YYYYMMDD-XXXXXX (e.g., ERR-20240115-A3F8K2)
pub fn generate_reference_code() -> String {
    let date = Utc::now().format("%Y%m%d");
    let mut rng = rand::thread_rng();
    let chars: Vec<char> = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".chars().collect();
    let random: String = (0..6)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect();
    format!("ERR-{}-{}", date, random)
}

// =============================================================================
// API ERROR TYPE
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    /// Invalid request from client (400)
    BadRequest { message: String },
    /// Unknown job or file (404)
    NotFound { message: String },
    /// yt-dlp missing or queue stopped (503)
    ServiceUnavailable { message: String },
    /// yt-dlp ran and failed (502)
    BadGateway { message: String, reference: String },
    /// Internal server error (500), never exposes details
    Internal { message: String, reference: String },
}

/// JSON body of an error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::BadRequest { message }
            | ApiError::NotFound { message }
            | ApiError::ServiceUnavailable { message }
            | ApiError::BadGateway { message, .. }
            | ApiError::Internal { message, .. } => message,
        }
    }

    pub fn reference(&self) -> Option<&str> {
        match self {
            ApiError::BadGateway { reference, .. } | ApiError::Internal { reference, .. } => {
                Some(reference)
            }
            _ => None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::warn!("Service unavailable: {}", message);
        Self::ServiceUnavailable { message }
    }

    /// The external tool failed. Its message is shown with paths redacted.
    pub fn bad_gateway(details: &str) -> Self {
        let reference = generate_reference_code();
        tracing::error!(reference = %reference, details = %details, "yt-dlp failed");
        Self::BadGateway {
            message: sanitize_error_details(details),
            reference,
        }
    }

    /// Create an Internal error, logging full details internally.
    pub fn internal(details: &str) -> Self {
        let reference = generate_reference_code();
        tracing::error!(reference = %reference, details = %details, "Internal server error");
        Self::Internal {
            message: format!("An internal error occurred. Reference: {}", reference),
            reference,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.message().to_string(),
            reference: self.reference().map(str::to_string),
        };
        (status, Json(body)).into_response()
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        match &err {
            DownloadError::Discovery { tried } => {
                tracing::warn!("yt-dlp not found, tried {:?}", tried);
                ApiError::service_unavailable("yt-dlp not found. Please ensure yt-dlp is installed.")
            }
            DownloadError::InvalidRequest(_) | DownloadError::InvalidCeiling(_) => {
                ApiError::bad_request(err.to_string())
            }
            DownloadError::Runtime(details) => ApiError::bad_gateway(details),
            DownloadError::ManagerClosed => ApiError::service_unavailable(err.to_string()),
            DownloadError::Launch { .. } | DownloadError::Cleanup { .. } => {
                ApiError::internal(&err.to_string())
            }
        }
    }
}

impl From<FileError> for ApiError {
    fn from(err: FileError) -> Self {
        match err {
            FileError::InvalidName => ApiError::bad_request("Invalid filename"),
            FileError::NotFound => ApiError::not_found("File not found"),
            FileError::Io(e) => ApiError::internal(&format!("Failed to delete file: {e}")),
        }
    }
}

// =============================================================================
// ERROR SANITIZATION
// =============================================================================

static PATH_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"[A-Za-z]:\\[^\s]+").expect("Windows path regex"),
        Regex::new(r"/(?:home|usr|var|etc|opt|tmp|root|Users)/[^\s]+").expect("Unix path regex"),
        Regex::new(r"\\\\[^\s]+").expect("UNC path regex"),
    ]
});

/// Replace filesystem paths in a message with a placeholder.
pub fn sanitize_error_details(error: &str) -> String {
    PATH_PATTERNS.iter().fold(error.to_string(), |acc, pattern| {
        pattern.replace_all(&acc, "[PATH_REDACTED]").into_owned()
    })
}

/// Result type for HTTP handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_generate_reference_code() {
        let code = generate_reference_code();
        assert!(code.starts_with("ERR-"));
        assert_eq!(code.len(), 19);
        assert_ne!(code, generate_reference_code());
    }

    #[test]
    fn test_download_error_mapping() {
        let discovery: ApiError = DownloadError::Discovery { tried: vec!["yt-dlp".into()] }.into();
        assert_eq!(discovery.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(discovery.message(), "yt-dlp not found. Please ensure yt-dlp is installed.");

        let ceiling: ApiError = DownloadError::InvalidCeiling(42).into();
        assert_eq!(ceiling.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ceiling.message(), "Limit must be between 1 and 10");

        let runtime: ApiError = DownloadError::Runtime("ERROR: Unsupported URL".into()).into();
        assert_eq!(runtime.status_code(), StatusCode::BAD_GATEWAY);

        let closed: ApiError = DownloadError::ManagerClosed.into();
        assert_eq!(closed.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_internal_error_never_exposes_details() {
        let err: ApiError = DownloadError::Launch {
            program: PathBuf::from("/home/user/bin/yt-dlp"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.message().contains("/home/user"));
        assert!(err.message().contains(err.reference().unwrap()));
    }

    #[test]
    fn test_file_error_mapping() {
        assert_eq!(ApiError::from(FileError::InvalidName).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::from(FileError::NotFound).status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_sanitize_paths() {
        let cleaned = sanitize_error_details("ERROR: unable to open /home/alice/videos/x.mp4 for writing");
        assert_eq!(cleaned, "ERROR: unable to open [PATH_REDACTED] for writing");
        let cleaned = sanitize_error_details(r"cannot write C:\Users\bob\a.mp4");
        assert!(!cleaned.contains("bob"));
    }
}
