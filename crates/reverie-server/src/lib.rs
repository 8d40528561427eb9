// crates/reverie-server/src/lib.rs
// Reverie - long-term conversational memory for chat characters

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod background;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod http;
pub mod index;
pub mod lore;
pub mod manager;
pub mod retrieval;
pub mod retry;
pub mod store;
pub mod testing;
pub mod utils;
pub use error::{ReverieError, Result};
