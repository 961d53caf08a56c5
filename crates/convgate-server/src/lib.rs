//! Network domain of the gateway: WebSocket sessions, the listener, command
//! routing, and event fan-out.

pub mod broadcaster;
pub mod router;
pub mod server;
pub mod session;

pub use broadcaster::{Broadcaster, SessionRegistry};
pub use router::{CommandRouter, RouteOutcome};
pub use server::{start, Gateway, ServerConfig, ServerHandle};
pub use session::{FrameHandler, Outbound, Session};
