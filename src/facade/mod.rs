pub mod queries;
pub mod repository;
pub mod transactions;

pub use repository::Repository;
pub use transactions::{FnWork, UnitOfWork};
