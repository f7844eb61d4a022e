//! Service-wide error taxonomy.
//!
//! # Purpose
//! One error type whose variants carry the caller-visible message. Internal
//! components match on [`Error::kind`]; the gateway maps kinds to wire codes
//! and masks existence where required.
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error("{0}")]
    AmbiguousChoice(String),
    #[error("{0}")]
    LeaseUnavailable(String),
    #[error("{0}")]
    ApiConnection(String),
    #[error("{0}")]
    NotSupported(String),
    #[error("{0}")]
    DatabaseLocked(String),
    #[error("{0}")]
    ControllerRemoved(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    NotFound,
    Unauthorized,
    BadRequest,
    AlreadyExists,
    AmbiguousChoice,
    LeaseUnavailable,
    ApiConnection,
    NotSupported,
    DatabaseLocked,
    ControllerRemoved,
    Unexpected,
}

impl Error {
    pub fn kind(&self) -> Kind {
        match self {
            Error::NotFound(_) => Kind::NotFound,
            Error::Unauthorized(_) => Kind::Unauthorized,
            Error::BadRequest(_) => Kind::BadRequest,
            Error::AlreadyExists(_) => Kind::AlreadyExists,
            Error::AmbiguousChoice(_) => Kind::AmbiguousChoice,
            Error::LeaseUnavailable(_) => Kind::LeaseUnavailable,
            Error::ApiConnection(_) => Kind::ApiConnection,
            Error::NotSupported(_) => Kind::NotSupported,
            Error::DatabaseLocked(_) => Kind::DatabaseLocked,
            Error::ControllerRemoved(_) => Kind::ControllerRemoved,
            Error::Unexpected(_) => Kind::Unexpected,
        }
    }

    /// Maps not-found to unauthorized without touching other errors.
    ///
    /// Applied at the external boundary so callers cannot probe for the
    /// existence of objects they are not allowed to see.
    pub fn mask_not_found(self) -> Self {
        match self {
            Error::NotFound(_) => Error::Unauthorized("unauthorized".to_string()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(Error::NotFound("x".into()).kind(), Kind::NotFound);
        assert_eq!(
            Error::LeaseUnavailable("x".into()).kind(),
            Kind::LeaseUnavailable
        );
        assert_eq!(
            Error::Unexpected(anyhow::anyhow!("boom")).kind(),
            Kind::Unexpected
        );
    }

    #[test]
    fn mask_not_found_hides_existence() {
        let masked = Error::NotFound("model \"bob/m\" not found".into()).mask_not_found();
        assert_eq!(masked.kind(), Kind::Unauthorized);

        let untouched = Error::BadRequest("bad tag".into()).mask_not_found();
        assert_eq!(untouched.kind(), Kind::BadRequest);
        assert_eq!(untouched.to_string(), "bad tag");
    }

    #[test]
    fn messages_are_surfaced_verbatim() {
        let err = Error::AmbiguousChoice("more than one possible credential to use".into());
        assert_eq!(err.to_string(), "more than one possible credential to use");
    }
}
