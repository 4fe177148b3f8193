//! Persistent-connection transport used by stream sessions.
//!
//! A session only needs four primitives: connect, send one text payload,
//! receive frames in order, and close. [`WsConnector`] provides them over a
//! websocket; TLS for `wss://` endpoints is handled by the socket library.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::stream::client::StreamClientError;

/// One inbound data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// An established bidirectional connection.
pub trait Transport: Send + 'static {
    /// Sends one text frame.
    fn send_text(
        &mut self,
        text: String,
    ) -> impl Future<Output = Result<(), StreamClientError>> + Send;

    /// Waits for the next data frame.
    ///
    /// Returns `None` once the peer has closed the connection.
    fn next_frame(
        &mut self,
    ) -> impl Future<Output = Option<Result<Frame, StreamClientError>>> + Send;

    /// Closes the connection. Errors during close are not reported.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens transports for a session URL.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    fn connect(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Self::Transport, StreamClientError>> + Send;
}

/// Websocket connector backed by `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    type Transport = WsTransport;

    fn connect(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Self::Transport, StreamClientError>> + Send {
        let request = url.into_client_request();
        async move {
            let (socket, response) = connect_async(request?).await?;
            debug!(
                event = "ws_connected",
                status = response.status().as_u16()
            );
            Ok(WsTransport { socket })
        }
    }
}

/// Websocket connection produced by [`WsConnector`].
pub struct WsTransport {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport").finish_non_exhaustive()
    }
}

impl Transport for WsTransport {
    fn send_text(
        &mut self,
        text: String,
    ) -> impl Future<Output = Result<(), StreamClientError>> + Send {
        async move {
            self.socket.send(Message::Text(text)).await?;
            Ok(())
        }
    }

    fn next_frame(
        &mut self,
    ) -> impl Future<Output = Option<Result<Frame, StreamClientError>>> + Send {
        async move {
            loop {
                match self.socket.next().await {
                    Some(Ok(Message::Text(text))) => return Some(Ok(Frame::Text(text))),
                    Some(Ok(Message::Binary(bytes))) => return Some(Ok(Frame::Binary(bytes))),
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = self.socket.send(Message::Pong(payload)).await {
                            return Some(Err(err.into()));
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        debug!(
                            event = "ws_close_received",
                            code = frame.as_ref().map(|f| u16::from(f.code)),
                            reason = frame.as_ref().map(|f| f.reason.to_string())
                        );
                        return None;
                    }
                    Some(Err(err)) => return Some(Err(err.into())),
                    None => return None,
                }
            }
        }
    }

    fn close(&mut self) -> impl Future<Output = ()> + Send {
        async move {
            if let Err(err) = self.socket.close(None).await {
                debug!(event = "ws_close_failed", error = %err);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transport for driving sessions deterministically.

    use std::collections::VecDeque;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::{Connector, Frame, Transport};
    use crate::stream::client::StreamClientError;

    /// What the session did to its transport.
    #[derive(Debug, Default)]
    pub(crate) struct WireLog {
        pub(crate) sent: Mutex<Vec<String>>,
        pub(crate) closes: AtomicUsize,
    }

    impl WireLog {
        pub(crate) fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }

        pub(crate) fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    pub(crate) struct MockTransport {
        inbound: mpsc::UnboundedReceiver<Result<Frame, StreamClientError>>,
        wire: Arc<WireLog>,
    }

    /// Server side of a [`MockTransport`].
    pub(crate) struct MockPeer {
        frames: mpsc::UnboundedSender<Result<Frame, StreamClientError>>,
        pub(crate) wire: Arc<WireLog>,
    }

    impl MockPeer {
        pub(crate) fn text(&self, text: &str) {
            let _ = self.frames.send(Ok(Frame::Text(text.to_string())));
        }

        pub(crate) fn binary(&self, bytes: &[u8]) {
            let _ = self.frames.send(Ok(Frame::Binary(bytes.to_vec())));
        }

        pub(crate) fn fail(&self, message: &str) {
            let _ = self
                .frames
                .send(Err(StreamClientError::Protocol(message.to_string())));
        }
    }

    pub(crate) fn mock_pair() -> (MockTransport, MockPeer) {
        let (frames, inbound) = mpsc::unbounded_channel();
        let wire = Arc::new(WireLog::default());
        (
            MockTransport {
                inbound,
                wire: Arc::clone(&wire),
            },
            MockPeer { frames, wire },
        )
    }

    impl Transport for MockTransport {
        fn send_text(
            &mut self,
            text: String,
        ) -> impl Future<Output = Result<(), StreamClientError>> + Send {
            self.wire.sent.lock().push(text);
            async { Ok(()) }
        }

        fn next_frame(
            &mut self,
        ) -> impl Future<Output = Option<Result<Frame, StreamClientError>>> + Send {
            self.inbound.recv()
        }

        fn close(&mut self) -> impl Future<Output = ()> + Send {
            self.wire.closes.fetch_add(1, Ordering::SeqCst);
            async {}
        }
    }

    /// Hands out queued transports in order; connecting with an empty queue
    /// fails like a refused connection.
    #[derive(Default)]
    pub(crate) struct MockConnector {
        transports: Mutex<VecDeque<MockTransport>>,
        pub(crate) urls: Mutex<Vec<String>>,
    }

    impl MockConnector {
        pub(crate) fn with_transports(transports: Vec<MockTransport>) -> Self {
            Self {
                transports: Mutex::new(transports.into()),
                urls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn connects(&self) -> usize {
            self.urls.lock().len()
        }
    }

    impl Connector for MockConnector {
        type Transport = MockTransport;

        fn connect(
            &self,
            url: &str,
        ) -> impl Future<Output = Result<Self::Transport, StreamClientError>> + Send {
            self.urls.lock().push(url.to_string());
            let next = self.transports.lock().pop_front();
            async move { next.ok_or(StreamClientError::ConnectionClosed) }
        }
    }
}
