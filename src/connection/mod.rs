pub mod config;

pub use config::RepositoryConfig;
