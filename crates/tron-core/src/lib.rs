pub mod errors;
pub mod ids;
pub mod process;
pub mod tokens;
pub mod turns;

pub use errors::{ClassifiedError, FailureKind, TransportError};
pub use ids::{RunId, SessionKey, SessionKeyError, TurnId};
pub use process::{Liveness, ProcessIdentity};
pub use turns::{Role, ToolInvocation, ToolOutcome, Turn};
