pub mod budget;
pub mod config;
pub mod error;
pub mod types;

pub use budget::{budget_cap, fallback_chain, BudgetCaps};
pub use config::AqmConfig;
pub use error::AqmError;
pub use types::*;
