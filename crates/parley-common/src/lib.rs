pub mod context;
pub mod error;
pub mod message;
pub mod session;
pub mod types;
pub mod user;

pub use context::{RequestContext, StatusPhase, StatusSink, StatusUpdate};
pub use error::{Error, Result};
pub use message::{ChatMessage, ChatRole, SessionMessage, ToolCall};
pub use session::{PendingClarification, SequenceGenerator, Session};
pub use types::AgentType;
pub use user::User;
