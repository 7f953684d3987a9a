pub mod error;
pub mod types;
pub mod value;

pub use error::{RepoError, Result};
pub use types::FieldValue;
pub use value::{DataType, Value, format_timestamp, parse_timestamp};
