pub mod alert;
pub mod audit;
pub mod config;
pub mod database;
pub mod error;
pub mod export;
pub mod ots;
pub mod service;

pub use error::{LedgerError, LedgerResult};
pub use service::Ledger;
