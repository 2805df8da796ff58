/// Parley - two-party chat client
///
/// Keeps a local view of conversations and messages in step with a chat
/// server: state queries over HTTP, live activity over a WebSocket push
/// channel, and a single sync loop that reconciles the two.

pub mod error;
pub mod config;
pub mod messenger_types;
pub mod session;
pub mod fetcher;
pub mod api;
pub mod channel;
pub mod discovery;
pub mod engine;
pub mod runtime;
pub mod cli_app;

pub use error::{ChatError, Result};
pub use config::Config;
pub use engine::{SyncEngine, ViewState};
pub use runtime::{ChatRuntime, ClientHandle};
