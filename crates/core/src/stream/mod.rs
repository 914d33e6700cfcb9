//! Live stream session orchestrator.
//!
//! Starts a named server-side session, renders the frames the service pushes
//! over a Socket.IO channel, and owns the session's stop/cleanup transitions.

mod channel;
mod runner;
pub mod socketio;
mod types;

pub use channel::{
    channel, socket_endpoint, ChannelCloser, ChannelConnection, ChannelConnector, ChannelSender,
    SocketIoConnector,
};
pub use runner::StreamOrchestrator;
pub use types::{
    ChannelError, ChannelEvent, ErrorPayload, FrameEvent, SessionState, StreamSession,
};
