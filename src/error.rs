use thiserror::Error;

use crate::Size;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("operation on closed relay")]
    Closed,

    #[error("capture source reported an empty size ({0})")]
    EmptySource(Size),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
