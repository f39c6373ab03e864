pub mod auth;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod pusher;
pub mod registry;
pub mod session;

pub use auth::{AnonymousVerifier, Principal, PrincipalKind, TokenVerifier};
pub use connection::{run_connection, serve};
pub use error::SessionError;
pub use pusher::CommandPusher;
pub use registry::{SessionHandle, SessionRegistry};
pub use session::{SessionConfig, SessionContext};
