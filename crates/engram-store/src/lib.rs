pub mod db;
pub mod embedding;
pub mod error;
pub mod ledger;
pub mod search;
pub mod store;
pub mod types;

pub use error::StoreError;
pub use ledger::ProcessedLedger;
pub use store::FactStore;
pub use types::{Fact, NewFact, SearchHit, SearchQuery, UpsertOutcome, VerdictFilters};
