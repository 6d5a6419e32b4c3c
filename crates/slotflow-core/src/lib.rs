pub mod db;
pub mod error;
pub mod fetch;
pub mod ledger;
pub mod metadata;
pub mod normalize;
pub mod pipeline;
pub mod provision;
pub mod query;
pub mod registry;
pub mod retry;
pub mod scanner;
pub mod schedule;
pub mod sql;
pub mod upsert;
