// ============================================================================
// entityrepo
// ============================================================================
//
// Generic CRUD repository over a relational session with:
//
//   - change auditing: every write returns `ChangeResult` records
//   - tombstones: deleted rows can be archived into a parallel entity type
//   - transactional retry: `execute` re-runs a unit of work on deadlocks and
//     busy/locked errors, classified per backend
//
// Two sessions ship with the crate: an in-memory store (shared, single
// writer) and SQLite through rusqlite.
//
// ============================================================================

extern crate self as entityrepo;

pub mod connection;
pub mod core;
pub mod entity;
pub mod facade;
pub mod prelude;
pub mod result;
pub mod storage;
pub mod transaction;

pub use entityrepo_derive::Entity;

pub use connection::RepositoryConfig;
pub use core::{DataType, FieldValue, RepoError, Result, Value};
pub use entity::{
    Entity, EntityModel, EntityRegistry, EntityType, PropertyDescriptor, copy_to_tombstone,
    surrogate_key,
};
pub use facade::{FnWork, Repository, UnitOfWork};
pub use result::{ChangeFunction, ChangeResult, OperationResult, QueryResult, ResultCode};
pub use storage::{Filter, InMemorySession, InMemoryStore, SqliteSession, StorageSession};
pub use transaction::{
    BackendKind, CancellationSignal, ClassifierRegistry, ErrorCodeClassifier, IsolationLevel,
    RetryPolicy, TransactionOptions, TransactionScopeOption, TransientErrorClassifier,
};
