use serde::Serialize;
use thiserror::Error;
use warp::{Rejection, Reply, hyper::StatusCode, reject::Reject};

#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid video ID: '{0}'")]
    InvalidIdentifierError(String),
    #[error("No auth header provided")]
    MissingAuthHeaderError,
    #[error("Failed to decode request header as valid utf8")]
    UtfEncodingError,
    #[error("The auth header is not formatted correctly (expected JWT 'Bearer ' header)")]
    InvalidAuthHeaderError,
    #[error("The JWT is not or no longer valid")]
    InvalidJwtError,
    #[error("User does not own video {0}")]
    NotOwnerError(uuid::Uuid),
    #[error("Video {0} not found")]
    VideoNotFoundError(uuid::Uuid),
    #[error("The request is not formatted correctly: {0}")]
    BadRequestError(String),
    #[error("Unsupported media type '{0}'")]
    UnsupportedMediaTypeError(String),
    #[error("Upload exceeds the maximum size of {0} bytes")]
    PayloadTooLargeError(u64),
    #[error("Failed to stage upload: {0}")]
    StagingError(String),
    #[error("Failed to probe media: {0}")]
    ProbeError(String),
    #[error("Failed to remux video for fast start: {0}")]
    RemuxError(String),
    #[error("Failed to publish object: {0}")]
    PublishError(String),
    #[error("Failed to persist video record: {0}")]
    PersistError(String),
    #[error("Could not establish database connection")]
    DatabaseConnectionError,
    #[error("There has been an error executing a query: '{0}'")]
    QueryError(String),
    #[error("Invalid URL: {0}")]
    InvalidUrlError(String),
    #[error("Invalid bucket configuration: {0}")]
    InvalidBucketError(String),
    #[error("The task has been cancelled")]
    CancellationError,
}

impl Reject for Error {}

impl From<diesel::result::Error> for Error {
    fn from(e: diesel::result::Error) -> Self {
        Error::QueryError(e.to_string())
    }
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidIdentifierError(_)
            | Error::UtfEncodingError
            | Error::InvalidAuthHeaderError
            | Error::BadRequestError(_) => StatusCode::BAD_REQUEST,
            Error::MissingAuthHeaderError | Error::InvalidJwtError => StatusCode::UNAUTHORIZED,
            Error::NotOwnerError(_) => StatusCode::FORBIDDEN,
            Error::VideoNotFoundError(_) => StatusCode::NOT_FOUND,
            Error::PayloadTooLargeError(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Error::UnsupportedMediaTypeError(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::StagingError(_)
            | Error::ProbeError(_)
            | Error::RemuxError(_)
            | Error::PublishError(_)
            | Error::PersistError(_)
            | Error::DatabaseConnectionError
            | Error::QueryError(_)
            | Error::InvalidUrlError(_)
            | Error::InvalidBucketError(_)
            | Error::CancellationError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error is a fault of the server rather than the request.
    pub fn is_internal(&self) -> bool {
        self.status_code() == StatusCode::INTERNAL_SERVER_ERROR
    }
}

#[derive(Serialize, Debug)]
struct ErrorResponse {
    message: String,
    status: String,
}

/// Creates a Rejection response for the given error and logs internal server errors.
///
/// Internal errors are reported to the caller with a generic message, the detail only ends up in the log.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Rejection> {
    if let Some(e) = err.find::<Error>() {
        let code = e.status_code();
        let message = if e.is_internal() {
            log::error!("Encountered internal server error: {}", e);
            String::from("Internal server error")
        } else {
            e.to_string()
        };

        let err_response = ErrorResponse {
            message,
            status: code.to_string(),
        };

        let json = warp::reply::json(&err_response);

        Ok(warp::reply::with_status(json, code))
    } else {
        Err(err)
    }
}
