use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::error;
use serde::Serialize;

use crate::voting::VotingError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing required fields")]
    MissingFields(&'static [&'static str]),

    #[error("malformed request body: {0}")]
    MalformedBody(String),

    #[error("malformed query string: {0}")]
    MalformedQuery(String),

    /// Wrong admin key on poll creation.
    #[error("forbidden (admin only)")]
    Forbidden,

    /// Wrong admin key on reset or reconcile.
    #[error("unauthorized")]
    Unauthorized,

    #[error("no current poll")]
    NoCurrentPoll,

    #[error(transparent)]
    Voting(#[from] VotingError),
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    required: Option<&'static [&'static str]>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    retryable: bool,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingFields(_) | Self::MalformedBody(_) | Self::MalformedQuery(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NoCurrentPoll => StatusCode::NOT_FOUND,
            Self::Voting(err) => match err {
                VotingError::InvalidIdentifier(_)
                | VotingError::InvalidOption(_)
                | VotingError::InvalidPollId => StatusCode::BAD_REQUEST,
                VotingError::NotFound => StatusCode::NOT_FOUND,
                VotingError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = match &self {
            Self::MissingFields(required) => ErrorBody {
                message: "Missing required fields".to_string(),
                required: Some(*required),
                retryable: false,
            },
            Self::Voting(err @ VotingError::Storage(_)) => {
                error!("Storage failure: {}", err);
                ErrorBody {
                    message: "Storage failure, please retry".to_string(),
                    required: None,
                    retryable: err.is_retryable(),
                }
            }
            other => ErrorBody {
                message: other.to_string(),
                required: None,
                retryable: false,
            },
        };

        (status, Json(body)).into_response()
    }
}
