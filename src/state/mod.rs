pub mod database;
pub mod statedb;

pub use database::TrieDatabase;
pub use statedb::{empty_code_hash, Account, StateDb};
