pub mod message;
pub mod session;
pub mod table;

pub use message::{Message, Role};
pub use session::Session;
pub use table::{Table, TableSummary};
