//! Error handling.

use std::error::Error as StdError;

use anyhow::Error as AnyError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use displaydoc::Display;

use crate::origin::OriginError;
use crate::store::StoreError;
use strand::StrandError;

pub type ServerResult<T> = Result<T, ServerError>;

/// An error.
#[derive(Debug, Display)]
pub enum ServerError {
    // Generic responses
    /// The URL you requested was not found.
    NotFound,

    /// this content cannot be accessed at the moment
    Unauthorized,

    /// The server encountered an internal error or misconfiguration.
    InternalServerError,

    // Specialized responses
    /// could not resolve stream URI
    ClaimNotFound,

    /// edge credentials missing
    EdgeCredentialsMissing,

    /// edge authentication failed
    EdgeAuthenticationFailed,

    /// edge authentication misconfigured
    EdgeAuthenticationMisconfigured,

    /// paid stream
    PaidStream,

    /// {0}
    TokenError(strand_token::Error),

    /// blob not found
    BlobNotFound,

    /// hash in response does not match the requested hash
    HashMismatch,

    /// seeking out of bounds
    SeekOutOfBounds,

    /// seeking before the beginning of the stream
    SeekBeforeStart,

    /// stream size is zero
    StreamSizeZero,

    /// invalid range: failed to overlap
    RangeUnsatisfiable { size: u64 },

    /// invalid range
    RangeInvalid,

    /// Try again later
    RateLimited,

    /// this content cannot be accessed
    Blocked,

    /// downloads are currently disabled
    DownloadsDisabled,

    /// stream decryption failed
    DecryptionFailed,

    /// Database error: {0}
    DatabaseError(AnyError),

    /// Storage error: {0}
    StorageError(StoreError),

    /// General request error: {0}
    RequestError(AnyError),
}

impl ServerError {
    pub fn database_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::DatabaseError(AnyError::new(error))
    }

    pub fn request_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::RequestError(AnyError::new(error))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::Unauthorized => "Unauthorized",
            Self::InternalServerError => "InternalServerError",
            Self::ClaimNotFound => "ClaimNotFound",
            Self::EdgeCredentialsMissing => "EdgeCredentialsMissing",
            Self::EdgeAuthenticationFailed => "EdgeAuthenticationFailed",
            Self::EdgeAuthenticationMisconfigured => "EdgeAuthenticationMisconfigured",
            Self::PaidStream => "PaidStream",
            Self::TokenError(e) => e.name(),
            Self::BlobNotFound => "BlobNotFound",
            Self::HashMismatch => "HashMismatch",
            Self::SeekOutOfBounds => "SeekOutOfBounds",
            Self::SeekBeforeStart => "SeekBeforeStart",
            Self::StreamSizeZero => "StreamSizeZero",
            Self::RangeUnsatisfiable { .. } => "RangeUnsatisfiable",
            Self::RangeInvalid => "RangeInvalid",
            Self::RateLimited => "RateLimited",
            Self::Blocked => "Blocked",
            Self::DownloadsDisabled => "DownloadsDisabled",
            Self::DecryptionFailed => "DecryptionFailed",
            Self::DatabaseError(_) => "DatabaseError",
            Self::StorageError(_) => "StorageError",
            Self::RequestError(_) => "RequestError",
        }
    }

    /// Returns a version of this error for clients.
    ///
    /// Internal details are not leaked into response bodies.
    fn into_clients(self) -> Self {
        match self {
            Self::DatabaseError(_) => Self::InternalServerError,
            Self::StorageError(StoreError::NotFound) => Self::BlobNotFound,
            Self::StorageError(StoreError::HashMismatch) => Self::HashMismatch,
            Self::StorageError(StoreError::Decryption(_)) => Self::DecryptionFailed,
            Self::StorageError(_) => Self::InternalServerError,

            _ => self,
        }
    }

    pub fn http_status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::ClaimNotFound => StatusCode::NOT_FOUND,

            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::EdgeCredentialsMissing => StatusCode::UNAUTHORIZED,
            Self::EdgeAuthenticationFailed => StatusCode::UNAUTHORIZED,
            Self::EdgeAuthenticationMisconfigured => StatusCode::UNAUTHORIZED,

            Self::PaidStream => StatusCode::PAYMENT_REQUIRED,
            Self::TokenError(strand_token::Error::Expired) => StatusCode::GONE,
            Self::TokenError(_) => StatusCode::UNAUTHORIZED,

            Self::BlobNotFound => StatusCode::SERVICE_UNAVAILABLE,
            Self::HashMismatch => StatusCode::SERVICE_UNAVAILABLE,
            Self::StorageError(StoreError::NotFound) => StatusCode::SERVICE_UNAVAILABLE,
            Self::StorageError(StoreError::HashMismatch) => StatusCode::SERVICE_UNAVAILABLE,

            Self::SeekOutOfBounds | Self::SeekBeforeStart | Self::StreamSizeZero => {
                StatusCode::RANGE_NOT_SATISFIABLE
            }
            Self::RangeUnsatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::RangeInvalid => StatusCode::RANGE_NOT_SATISFIABLE,

            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Blocked => StatusCode::FORBIDDEN,
            Self::DownloadsDisabled => StatusCode::FORBIDDEN,

            Self::RequestError(_) => StatusCode::BAD_REQUEST,

            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl StdError for ServerError {}

impl From<StrandError> for ServerError {
    fn from(error: StrandError) -> Self {
        match error {
            StrandError::SeekOutOfBounds => Self::SeekOutOfBounds,
            StrandError::SeekBeforeStart => Self::SeekBeforeStart,
            StrandError::StreamSizeZero => Self::StreamSizeZero,
            StrandError::DecryptionFailed { .. } => Self::DecryptionFailed,
            e => Self::RequestError(AnyError::new(e)),
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(error: StoreError) -> Self {
        Self::StorageError(error)
    }
}

impl From<OriginError> for ServerError {
    fn from(error: OriginError) -> Self {
        Self::StorageError(error.into())
    }
}

impl From<strand_token::Error> for ServerError {
    fn from(error: strand_token::Error) -> Self {
        Self::TokenError(error)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if matches!(
            self,
            Self::DatabaseError(_) | Self::StorageError(_) | Self::DecryptionFailed
        ) {
            tracing::error!("{:?}", self);
        }

        let sanitized = self.into_clients();
        let status_code = sanitized.http_status_code();

        // Unsatisfiable ranges must tell the client the actual size
        let content_range = if let Self::RangeUnsatisfiable { size } = &sanitized {
            Some(format!("bytes */{size}"))
        } else {
            None
        };

        let mut response = (status_code, sanitized.to_string()).into_response();
        if let Some(content_range) = content_range {
            response
                .headers_mut()
                .insert("Content-Range", content_range.parse().unwrap());
        }

        response
    }
}
