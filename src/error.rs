use crate::hash::Oid;
use std::fmt::{self, Display, Formatter};

pub type OrtResult<T> = Result<T, OrtGenericError>;
pub type OrtGenericError = anyhow::Error;

// usually we can just use anyhow for errors, but sometimes its nice to have a "rust" representation we can test or match against
#[derive(Debug)]
#[cfg_attr(test, derive(PartialEq))]
pub enum OrtError {
    /// an oid referenced during the merge is absent from the object store
    ObjectMissing(Oid),
    /// the bytes stored for `{0}` do not parse as a tree object
    MalformedTree(Oid),
    /// the bytes stored for `{0}` do not parse as a commit object
    MalformedCommit(Oid),
}

pub trait OrtErrorExt {
    fn try_into_ort_error(self) -> OrtResult<OrtError>;
    fn try_into_object_missing_err(self) -> OrtResult<Oid>;
}

impl OrtErrorExt for OrtGenericError {
    fn try_into_ort_error(self) -> OrtResult<OrtError> {
        self.downcast::<OrtError>()
    }

    /// tries to convert generic error into the specific error and just returns the previous error on failure
    fn try_into_object_missing_err(self) -> OrtResult<Oid> {
        match self.try_into_ort_error()? {
            OrtError::ObjectMissing(oid) => Ok(oid),
            err => Err(anyhow!(err)),
        }
    }
}

pub trait OrtResultExt {
    fn is_object_missing_err(&self) -> bool;
}

impl<T> OrtResultExt for OrtResult<T> {
    fn is_object_missing_err(&self) -> bool {
        match self {
            Ok(..) => false,
            Err(err) => err.is_object_missing_err(),
        }
    }
}

impl OrtResultExt for OrtGenericError {
    fn is_object_missing_err(&self) -> bool {
        matches!(self.downcast_ref::<OrtError>(), Some(OrtError::ObjectMissing(..)))
    }
}

impl Display for OrtError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OrtError::ObjectMissing(oid) => write!(f, "object with hash `{}` not found", oid),
            OrtError::MalformedTree(oid) => write!(f, "object `{}` is not a valid tree", oid),
            OrtError::MalformedCommit(oid) => write!(f, "object `{}` is not a valid commit", oid),
        }
    }
}

impl std::error::Error for OrtError {
}
