pub mod dispatcher;
pub mod locks;
pub mod progress;
pub mod scheduler;
pub mod state;

pub use dispatcher::{DispatchOutcome, RequestDispatcher};
pub use locks::KeyedLocks;
pub use progress::ProgressGuard;
pub use scheduler::{SummarizationReport, SummarizationScheduler};
pub use state::{Gateway, GatewayBuilder, build_provider, open_stores};
