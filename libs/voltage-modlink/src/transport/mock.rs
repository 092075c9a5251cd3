//! Mock Transport for Testing
//!
//! Scripted in-memory link. Every call is recorded as a [`MockEvent`] so
//! tests can assert on call ordering; replies come from a responder closure
//! or from chunks queued up front.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{Transport, TransportError};

/// Produces the reply chunks for one sent frame
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// One recorded transport call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Connect,
    ConnectFailed,
    Disconnect,
    Send(Vec<u8>),
    Receive(Vec<u8>),
}

#[derive(Default)]
struct MockState {
    connected: bool,
    failing_connects: usize,
    connect_delay: Duration,
    events: Vec<MockEvent>,
    /// Chunks handed out by `receive`; an empty chunk reads as end of stream
    pending: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
}

/// Mock transport; clones share state so a test can keep a handle
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockTransport")
            .field("connected", &state.connected)
            .field("events", &state.events.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every sent frame with `responder(frame)`
    pub fn with_responder(
        responder: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    ) -> Self {
        let mock = Self::new();
        mock.state.lock().responder = Some(Box::new(responder));
        mock
    }

    /// Queue reply chunks returned by subsequent receives
    pub fn push_response(&self, chunk: impl Into<Vec<u8>>) {
        self.state.lock().pending.push_back(chunk.into());
    }

    /// Fail the next `count` connect attempts
    pub fn fail_connects(&self, count: usize) {
        self.state.lock().failing_connects = count;
    }

    /// Make every connect attempt take `delay` before it resolves
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.state.lock().events.clone()
    }

    /// Frames written so far, in order
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                MockEvent::Send(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, event: fn(&MockEvent) -> bool) -> usize {
        self.state.lock().events.iter().filter(|e| event(e)).count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn transport_type(&self) -> &str {
        "mock"
    }

    fn name(&self) -> &str {
        "Mock Transport"
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let delay = self.state.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            state.events.push(MockEvent::ConnectFailed);
            return Err(TransportError::ConnectionFailed(
                "Simulated connection failure".to_string(),
            ));
        }
        state.connected = true;
        state.events.push(MockEvent::Connect);
        debug!("Mock connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.connected {
            state.connected = false;
            state.pending.clear();
            state.events.push(MockEvent::Disconnect);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.events.push(MockEvent::Send(data.to_vec()));
        let replies = state
            .responder
            .as_mut()
            .map(|responder| responder(data))
            .unwrap_or_default();
        state.pending.extend(replies);
        Ok(data.len())
    }

    async fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        let chunk = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            state.pending.pop_front()
        };

        // Nothing scripted: behave like a silent device
        let Some(mut chunk) = chunk else {
            return futures::future::pending().await;
        };

        let n = chunk.len().min(buffer.len());
        buffer[..n].copy_from_slice(&chunk[..n]);
        let mut state = self.state.lock();
        if n < chunk.len() {
            state.pending.push_front(chunk.split_off(n));
        }
        state.events.push(MockEvent::Receive(buffer[..n].to_vec()));
        Ok(n)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_exchange_is_recorded() {
        let mut mock =
            MockTransport::with_responder(|frame| vec![frame[..1].to_vec(), frame[1..].to_vec()]);
        let handle = mock.clone();

        mock.connect().await.unwrap();
        mock.send(&[1, 2, 3]).await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(mock.receive(&mut buf).await.unwrap(), 1);
        assert_eq!(mock.receive(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], &[2, 3]);

        assert_eq!(
            handle.events(),
            vec![
                MockEvent::Connect,
                MockEvent::Send(vec![1, 2, 3]),
                MockEvent::Receive(vec![1]),
                MockEvent::Receive(vec![2, 3]),
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_failures_then_success() {
        let mut mock = MockTransport::new();
        mock.fail_connects(2);
        assert!(mock.connect().await.is_err());
        assert!(mock.connect().await.is_err());
        assert!(mock.connect().await.is_ok());
        assert_eq!(mock.count(|e| matches!(e, MockEvent::ConnectFailed)), 2);
    }

    #[tokio::test]
    async fn test_empty_chunk_is_end_of_stream() {
        let mut mock = MockTransport::new();
        mock.connect().await.unwrap();
        mock.push_response(Vec::new());
        let mut buf = [0u8; 4];
        assert_eq!(mock.receive(&mut buf).await.unwrap(), 0);
    }
}
