use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("not found: {reason}")]
    NotFound { reason: String },
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },
    #[error("bad request: {reason}")]
    BadRequest { reason: String },
    #[error("conflict: {reason}")]
    Conflict { reason: String },
    #[error("upstream failure: {reason}")]
    UpstreamFailure { reason: String },
    #[error("nothing to delete")]
    NothingToDelete,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl LedgerError {
    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::NotFound {
            reason: reason.into(),
        }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::BadRequest {
            reason: reason.into(),
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    pub fn upstream(reason: impl Into<String>) -> Self {
        Self::UpstreamFailure {
            reason: reason.into(),
        }
    }

    /// Stable machine-readable reason, e.g. `crawl_not_found`.
    pub fn reason(&self) -> &str {
        match self {
            Self::NotFound { reason }
            | Self::Forbidden { reason }
            | Self::BadRequest { reason }
            | Self::Conflict { reason }
            | Self::UpstreamFailure { reason } => reason,
            Self::NothingToDelete => "nothing_to_delete",
            Self::Store(_) => "store_error",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::Forbidden { .. } => 403,
            Self::BadRequest { .. } | Self::NothingToDelete => 400,
            Self::Conflict { .. } => 409,
            Self::UpstreamFailure { .. } => 502,
            Self::Store(_) => 500,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            status: self.status(),
            detail: self.reason().to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub status: u16,
    pub detail: String,
}

pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_and_status_classes_are_stable() {
        let err = LedgerError::not_found("crawl_not_found");
        assert_eq!(err.reason(), "crawl_not_found");
        assert_eq!(err.status(), 404);

        assert_eq!(LedgerError::NothingToDelete.reason(), "nothing_to_delete");
        assert_eq!(LedgerError::NothingToDelete.status(), 400);
        assert_eq!(LedgerError::upstream("file_deletion_error").status(), 502);
        assert_eq!(
            LedgerError::conflict("crawl_already_in_collection").to_body(),
            ErrorBody {
                status: 409,
                detail: "crawl_already_in_collection".to_string(),
            }
        );
    }
}
