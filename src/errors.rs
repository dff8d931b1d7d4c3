use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("sqlx error: {0}")]
    SQLXError(sqlx::Error),
    #[error("sea-query error: {0}")]
    SeaQueryError(#[from] sea_query::error::Error),
    #[error("config deserialization error")]
    ConfigError(#[from] serde_yaml::Error),
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("http error")]
    HTTPError(#[from] http::Error),
    #[error("http invalid header name")]
    HTTPInvalidHeaderName(#[from] http::header::InvalidHeaderName),
    #[error("http invalid header value")]
    HTTPInvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
    #[error("body read error: {0}")]
    HyperError(#[from] hyper::Error),
    #[error("error serializing to value")]
    SerdeJsonToValueError(#[from] serde_json::Error),
    #[error("statvfs error: {0}")]
    StatvfsError(#[from] nix::Error),

    // input validation errors
    #[error("invalid uuid")]
    InvalidUuid(#[from] uuid::Error),
    #[error("invalid digest: {0}")]
    InvalidDigest(String),
    #[error("unsupported manifest content type: {0}")]
    UnsupportedManifestType(String),

    #[error("missing query parameter: {0}")]
    MissingQueryParameter(&'static str),
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
    #[error("missing path parameter: {0}")]
    MissingPathParameter(&'static str),

    // upload protocol errors; the offending session keeps its chunks so
    // the client may retry
    #[error("upload session {0} not known to registry")]
    SessionUnknown(Uuid),
    #[error("chunk index {got} out of sequence for session {session} (expected {expected})")]
    ChunkIndexMismatch {
        session: Uuid,
        expected: i64,
        got: i64,
    },
    #[error("chunk rows for session {0} do not form a dense index prefix")]
    ChunkGap(Uuid),
    #[error("computed digest {computed} does not match declared digest {declared}")]
    DigestMismatch { declared: String, computed: String },

    #[error("storage corruption detected: {0}")]
    Corruption(String),

    // distribution error codes
    // https://github.com/opencontainers/distribution-spec/blob/main/spec.md#error-codes
    #[error("distribution spec error: {0:?}")]
    DistributionSpecError(DistributionErrorCode),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(dbe) = &e {
            let msg = dbe.message();
            if msg.contains("malformed") || msg.contains("corrupt") {
                return Error::Corruption(msg.to_string());
            }
        }
        Error::SQLXError(e)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistributionErrorCode {
    BlobUnknown = 1,         // blob unknown to registry
    BlobUploadInvalid = 2,   // blob upload invalid
    BlobUploadUnknown = 3,   // blob upload unknown to registry
    DigestInvalid = 4,       // provided digest did not match uploaded content
    ManifestBlobUnknown = 5, // manifest references a manifest or blob unknown to registry
    ManifestInvalid = 6,     // manifest invalid
    ManifestUnknown = 7,     // manifest unknown to registry
    NameInvalid = 8,         // invalid repository name
    NameUnknown = 9,         // repository name not known to registry
    SizeInvalid = 10,        // provided length did not match content length
    Unauthorized = 12,       // authentication required
    Denied = 13,             // requested access to the resource is denied
    Unsupported = 14,        // the operation is unsupported
    TooManyRequests = 15,    // too many requests
}

impl DistributionErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DistributionErrorCode::BlobUnknown => StatusCode::NOT_FOUND,
            DistributionErrorCode::BlobUploadInvalid => StatusCode::RANGE_NOT_SATISFIABLE,
            DistributionErrorCode::BlobUploadUnknown => StatusCode::BAD_REQUEST,
            DistributionErrorCode::DigestInvalid => StatusCode::BAD_REQUEST,
            DistributionErrorCode::ManifestBlobUnknown => StatusCode::NOT_FOUND,
            DistributionErrorCode::ManifestInvalid => StatusCode::BAD_REQUEST,
            DistributionErrorCode::ManifestUnknown => StatusCode::NOT_FOUND,
            DistributionErrorCode::NameInvalid => StatusCode::BAD_REQUEST,
            DistributionErrorCode::NameUnknown => StatusCode::NOT_FOUND,
            DistributionErrorCode::SizeInvalid => StatusCode::BAD_REQUEST,
            DistributionErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            DistributionErrorCode::Denied => StatusCode::FORBIDDEN,
            DistributionErrorCode::Unsupported => StatusCode::NOT_IMPLEMENTED,
            DistributionErrorCode::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::DistributionSpecError(dec) => (dec.status_code(), format!("{dec:?}")),
            Error::InvalidUuid(_) => (StatusCode::BAD_REQUEST, format!("{self}")),
            Error::InvalidDigest(_) => (StatusCode::BAD_REQUEST, format!("{self}")),
            Error::UnsupportedManifestType(_) => (StatusCode::BAD_REQUEST, format!("{self}")),
            Error::MissingHeader(_) => (StatusCode::BAD_REQUEST, format!("{self}")),
            Error::MissingQueryParameter(_) => (StatusCode::BAD_REQUEST, format!("{self}")),
            Error::MissingPathParameter(_) => (StatusCode::BAD_REQUEST, format!("{self}")),
            Error::SessionUnknown(_) => (StatusCode::BAD_REQUEST, format!("{self}")),
            Error::ChunkIndexMismatch { .. } => (StatusCode::BAD_REQUEST, format!("{self}")),
            Error::ChunkGap(_) => (StatusCode::BAD_REQUEST, format!("{self}")),
            Error::DigestMismatch { .. } => (StatusCode::BAD_REQUEST, format!("{self}")),
            Error::Corruption(_) => {
                tracing::error!("{self}");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    String::from("storage engine unavailable"),
                )
            }
            _ => {
                tracing::warn!("{self:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    String::from("internal server error"),
                )
            }
        }
        .into_response()
    }
}
