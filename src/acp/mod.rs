//! Agent Client Protocol server: framing, sessions, prompt runs and
//! client-delegated tools.

pub mod client;
pub mod error;
pub mod executor;
pub mod server;
pub mod session;
pub mod transport;
pub mod types;

pub use client::{AcpClient, ClientHooks};
pub use error::{ErrorCode, RpcError, TransportError};
pub use executor::ToolExecutor;
pub use server::Handler;
pub use transport::{parse_params, Connection, MethodHandler, MAX_FRAME_BYTES};
pub use types::*;
