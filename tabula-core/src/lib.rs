pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod models;
pub mod render;
pub mod sanitize;

pub use config::TabulaConfig;
pub use error::TabulaError;
pub use extract::{extract_reply, EngineReply, RowLimits};
pub use models::{Message, Role, Session, Table, TableSummary};
