pub mod memory_store;
pub mod migrations;
pub mod session_store;
pub mod store;

pub use memory_store::InMemoryStore;
pub use session_store::SqliteStore;
pub use store::{
    MessageStore, OpenedFileRecord, OpenedFileStore, SessionStore, Stores, SummarizationLogRecord,
    SummarizationLogStore, ToolCallOutcome, ToolCallRecord, ToolCallStore, UserStore,
};
