//! Tabula client library
//!
//! Client-side mirror of the server's session state: an ordered session list
//! with an active-session pointer (`store`), a thin HTTP client with the
//! single in-flight chat guard (`api`), and CSV export artifact assembly
//! (`export`).

pub mod api;
pub mod export;
pub mod store;

pub use api::{ApiClient, ApiError, ChatResponse, ChatTurn};
pub use export::CsvExport;
pub use store::SessionStore;
