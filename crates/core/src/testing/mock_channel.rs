//! Mock event channel for testing.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::stream::{channel, ChannelConnection, ChannelConnector, ChannelError, ChannelEvent, ChannelSender};

const EVENT_BUFFER: usize = 64;

struct Connection {
    events: ChannelSender,
    shutdown: broadcast::Receiver<()>,
    closed: bool,
}

#[derive(Default)]
struct MockChannelState {
    connections: Vec<Connection>,
    fail_next: bool,
    connect_delay: Option<Duration>,
}

/// Mock implementation of the ChannelConnector trait.
///
/// Every `connect` opens a fresh in-memory channel; `emit` pushes events
/// into the most recent one, as if the service had sent them.
#[derive(Clone, Default)]
pub struct MockChannelConnector {
    state: Arc<Mutex<MockChannelState>>,
}

impl MockChannelConnector {
    /// Create a new mock connector.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockChannelState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Make the next connect attempt fail.
    pub fn fail_next_connect(&self) {
        self.state().fail_next = true;
    }

    /// Delay every connect attempt by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = Some(delay);
    }

    /// Number of channels opened so far.
    pub fn connect_count(&self) -> usize {
        self.state().connections.len()
    }

    /// Deliver an event on the most recent channel.
    ///
    /// `Disconnected` also ends that channel, like a real transport would.
    /// Events for a channel that is already gone are discarded.
    pub fn emit(&self, event: ChannelEvent) {
        let mut state = self.state();
        let Some(connection) = state.connections.last_mut() else {
            return;
        };
        let ends = matches!(event, ChannelEvent::Disconnected(_));
        connection.events.try_send(event);
        if ends {
            // Replace the sender so the receiver observes the end of stream.
            let (orphan, _) = channel(1, broadcast::channel(1).0);
            connection.events = orphan;
        }
    }

    /// Whether the most recent channel was closed by its owner.
    pub fn was_closed(&self) -> bool {
        let mut state = self.state();
        let Some(connection) = state.connections.last_mut() else {
            return false;
        };
        if !connection.closed {
            connection.closed = matches!(
                connection.shutdown.try_recv(),
                Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_))
            );
        }
        connection.closed
    }
}

#[async_trait]
impl ChannelConnector for MockChannelConnector {
    async fn connect(&self) -> Result<ChannelConnection, ChannelError> {
        let delay = self.state().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.fail_next {
            state.fail_next = false;
            return Err(ChannelError::Connect("connection refused".to_string()));
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (tx, connection) = channel(EVENT_BUFFER, shutdown_tx);
        tx.try_send(ChannelEvent::Connected);
        state.connections.push(Connection {
            events: tx,
            shutdown: shutdown_rx,
            closed: false,
        });
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_latest_connection() {
        let connector = MockChannelConnector::new();
        let mut connection = connector.connect().await.unwrap();

        connector.emit(ChannelEvent::Error("boom".to_string()));

        assert_eq!(connection.recv().await, Some(ChannelEvent::Connected));
        assert_eq!(
            connection.recv().await,
            Some(ChannelEvent::Error("boom".to_string()))
        );
    }

    #[tokio::test]
    async fn test_disconnect_ends_stream() {
        let connector = MockChannelConnector::new();
        let mut connection = connector.connect().await.unwrap();

        connector.emit(ChannelEvent::Disconnected("gone".to_string()));

        assert_eq!(connection.recv().await, Some(ChannelEvent::Connected));
        assert!(matches!(
            connection.recv().await,
            Some(ChannelEvent::Disconnected(_))
        ));
        assert_eq!(connection.recv().await, None);
    }

    #[tokio::test]
    async fn test_close_is_observed() {
        let connector = MockChannelConnector::new();
        let connection = connector.connect().await.unwrap();
        assert!(!connector.was_closed());

        connection.closer().close();
        assert!(connector.was_closed());
    }

    #[tokio::test]
    async fn test_fail_next_connect() {
        let connector = MockChannelConnector::new();
        connector.fail_next_connect();

        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert_eq!(connector.connect_count(), 1);
    }
}
