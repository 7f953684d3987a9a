pub mod change;
pub mod outcome;
pub mod query;

pub use change::{ALL_FIELDS, ChangeFunction, ChangeResult};
pub use outcome::{OperationResult, ResultCode};
pub use query::{QueryResult, Row};
