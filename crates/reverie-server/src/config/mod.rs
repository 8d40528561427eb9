// crates/reverie-server/src/config/mod.rs
// Configuration layers: defaults, config file, environment

pub mod env;
pub mod file;
pub mod memory;

pub use env::{ApiKeys, ConfigValidation, EmbeddingsConfig, EnvConfig};
pub use file::ReverieConfig;
pub use memory::{BudgetUnit, MemoryConfig, RetryConfig, Truncation};
