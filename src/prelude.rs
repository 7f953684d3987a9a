//! Everything needed to declare entities and drive a repository.
//!
//! ```ignore
//! use entityrepo::prelude::*;
//! ```

pub use crate::Entity;
pub use crate::entity::{EntityModel, EntityType};
pub use crate::connection::RepositoryConfig;
pub use crate::core::{RepoError, Result, Value};
pub use crate::facade::{FnWork, Repository, UnitOfWork};
pub use crate::result::{ChangeFunction, ChangeResult, OperationResult, ResultCode};
pub use crate::storage::{InMemorySession, InMemoryStore, SqliteSession, StorageSession};
pub use crate::transaction::{
    BackendKind, CancellationSignal, ClassifierRegistry, IsolationLevel, TransactionScopeOption,
};
