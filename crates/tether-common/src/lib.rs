pub mod error;
pub mod protocol;

pub use error::{ErrorBody, ErrorKind, RelayError};
