//! Persistent tool channel to the viaNexus MCP server: OAuth bootstrap,
//! streamable-HTTP transport, tool discovery and invocation, health checks.

pub mod auth;
pub mod channel;
pub mod error;
pub mod setup;

pub use auth::{AccessTokenProvider, SoftwareStatementAuth, StaticTokenAuth};
pub use channel::{ToolCallOutcome, ToolChannel, ToolDescriptor, ToolDispatcher};
pub use error::ChannelError;
pub use setup::ToolChannelSetup;
