pub mod memory;
pub mod session;
pub mod sqlite;
pub mod table;

pub use memory::{InMemorySession, InMemoryStore};
pub use session::{Filter, SaveReport, SqlDialect, StorageSession};
pub use sqlite::{SqliteSession, create_table_sql};
pub use table::Table;
