//! Gateway server implementation

pub mod auth;
mod handler;
mod router;
mod server;
mod session;

pub use auth::{CallMetadata, SESSION_HEADER};
pub use handler::{CallContext, McpHandler, SERVER_NAME};
pub use router::{AppState, create_router};
pub use server::Gateway;
pub use session::{InflightRegistry, Session, SessionKind, SessionStore};
