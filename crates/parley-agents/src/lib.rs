pub mod backup;
pub mod callback;
pub mod openai;
pub mod profile;
pub mod providers;
pub mod tool_loop;
pub mod tools;
pub mod verifier;

pub use backup::{BackupChain, BackupLlm, FailoverProvider};
pub use callback::{ActionCallback, ActionEvent, ActionKind};
pub use openai::OpenAiProvider;
pub use profile::AgentProfile;
pub use providers::{Choice, LlmProvider, LlmRequest, LlmResponse, ToolDefinition, Usage};
pub use tool_loop::{
    NoPending, PendingMessages, ToolCallLoop, Turn, TurnFailure, TurnInput, TurnOutcome,
    TurnReply,
};
pub use tools::{Tool, ToolContext, ToolExecutor, ToolOutput, ToolRegistry};
pub use verifier::LlmNonsenseVerifier;
