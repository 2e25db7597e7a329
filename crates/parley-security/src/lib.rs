pub mod heuristics;
pub mod moderation;
pub mod redaction;

pub use heuristics::{NonsenseSignal, detect_nonsense};
pub use moderation::{ModerationGate, ModerationVerdict, NonsenseVerifier};
pub use redaction::{RedactingWriter, redact_secrets};
