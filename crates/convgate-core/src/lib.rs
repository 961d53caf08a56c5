//! Shared vocabulary for the conversion gateway: identifiers, the inbound
//! command envelope, outbound job events, and the error taxonomy.

pub mod command;
pub mod errors;
pub mod escape;
pub mod events;
pub mod ids;

pub use command::{CommandEnvelope, CommandKind, Direction};
pub use errors::{DispatchError, GatewayError, OperationError};
pub use escape::escape_json;
pub use events::{EventBus, EventKind, JobEvent};
pub use ids::{JobId, SessionId};
