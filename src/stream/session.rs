//! Lifecycle of one streaming generation session.
//!
//! A session connects, sends its request exactly once, then classifies
//! inbound frames and reports them to a [`SessionObserver`] until a terminal
//! frame, a transport failure or a cancellation ends it. The driver task is
//! the sole owner of the transport and closes it exactly once on every exit
//! path that got past connect.
//!
//! Observer callbacks run under a dispatch gate shared by every session of a
//! client. Cancellation takes the same gate, so once `cancel` returns the
//! canceled session can no longer reach its observer. The gate is reentrant:
//! an observer may cancel or start sessions from inside a callback.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::retry::with_timeout;
use crate::stream::proto::{InboundFrame, ServerMessage};
use crate::stream::transport::{Connector, Frame, Transport};

/// Error text reported for frames that cannot be understood.
pub const MALFORMED_MESSAGE: &str = "malformed message";

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    /// Payload sent; inbound frames are being delivered.
    Active,
    /// Ended by a transport failure.
    Failed,
    /// Ended by a terminal frame, a protocol error, or cancellation.
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// Failure reported to [`SessionObserver::on_error`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The server reported a generation failure.
    #[error("{message}")]
    Server { message: String },

    /// A frame could not be parsed or was not expected.
    #[error("{0}")]
    Protocol(String),

    /// The connection could not be established or was lost.
    #[error("websocket connection failed: {0}")]
    Transport(String),
}

impl SessionError {
    pub fn malformed() -> Self {
        Self::Protocol(MALFORMED_MESSAGE.to_string())
    }
}

/// Receives session lifecycle notifications.
///
/// For a given session `on_start` fires at most once and before any other
/// callback; at most one of `on_result` / `on_error` fires and it is always
/// the last callback.
pub trait SessionObserver: Send + Sync {
    /// Connection established and request sent.
    fn on_start(&self) {}

    fn on_progress(&self, _progress: f64, _step: u64) {}

    fn on_result(&self, _data: Value) {}

    fn on_error(&self, _error: &SessionError) {}
}

/// Observer notification as a value, for channel-based consumers.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Started,
    Progress { progress: f64, step: u64 },
    Result { data: Value },
    Error { error: SessionError },
}

impl SessionObserver for mpsc::UnboundedSender<SessionEvent> {
    fn on_start(&self) {
        let _ = self.send(SessionEvent::Started);
    }

    fn on_progress(&self, progress: f64, step: u64) {
        let _ = self.send(SessionEvent::Progress { progress, step });
    }

    fn on_result(&self, data: Value) {
        let _ = self.send(SessionEvent::Result { data });
    }

    fn on_error(&self, error: &SessionError) {
        let _ = self.send(SessionEvent::Error {
            error: error.clone(),
        });
    }
}

type StartFn = Box<dyn Fn() + Send + Sync>;
type ProgressFn = Box<dyn Fn(f64, u64) + Send + Sync>;
type ResultFn = Box<dyn Fn(Value) + Send + Sync>;
type ErrorFn = Box<dyn Fn(&SessionError) + Send + Sync>;

/// Closure-based observer. Unset callbacks are ignored.
#[derive(Default)]
pub struct SessionCallbacks {
    on_start: Option<StartFn>,
    on_progress: Option<ProgressFn>,
    on_result: Option<ResultFn>,
    on_error: Option<ErrorFn>,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_on_start(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    pub fn with_on_progress(mut self, f: impl Fn(f64, u64) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn with_on_result(mut self, f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_result = Some(Box::new(f));
        self
    }

    pub fn with_on_error(mut self, f: impl Fn(&SessionError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCallbacks")
            .field("on_start", &self.on_start.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .field("on_result", &self.on_result.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl SessionObserver for SessionCallbacks {
    fn on_start(&self) {
        if let Some(f) = &self.on_start {
            f();
        }
    }

    fn on_progress(&self, progress: f64, step: u64) {
        if let Some(f) = &self.on_progress {
            f(progress, step);
        }
    }

    fn on_result(&self, data: Value) {
        if let Some(f) = &self.on_result {
            f(data);
        }
    }

    fn on_error(&self, error: &SessionError) {
        if let Some(f) = &self.on_error {
            f(error);
        }
    }
}

/// Serializes observer callbacks with cancellation across a client's
/// sessions.
pub(crate) type DispatchGate = Arc<ReentrantMutex<()>>;

/// State shared between a session's driver task, its handle and the client
/// slot.
pub(crate) struct SessionCore {
    id: u64,
    /// Dropped once the session ends so a channel observer's receiver sees
    /// the channel close.
    observer: Mutex<Option<Arc<dyn SessionObserver>>>,
    gate: DispatchGate,
    canceled: AtomicBool,
    state: watch::Sender<SessionState>,
    cancel_signal: Notify,
}

impl SessionCore {
    pub(crate) fn new(id: u64, observer: Box<dyn SessionObserver>, gate: DispatchGate) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            id,
            observer: Mutex::new(Some(Arc::from(observer))),
            gate,
            canceled: AtomicBool::new(false),
            state,
            cancel_signal: Notify::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Moves the session to `next` unless it already reached a terminal
    /// state.
    fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            *state = next;
            true
        })
    }

    pub(crate) fn begin(&self) {
        self.transition(SessionState::Connecting);
    }

    /// Cancels the session and leaves it `Closed`, whatever state it was in.
    /// Returns `true` only if the session was still running.
    ///
    /// Blocks until any callback this session is running on another thread
    /// has returned.
    pub(crate) fn cancel(&self) -> bool {
        let _gate = self.gate.lock();
        if self.canceled.swap(true, Ordering::SeqCst) {
            return false;
        }
        let was_running = !self.state().is_terminal();
        self.state.send_if_modified(|state| {
            let changed = *state != SessionState::Closed;
            *state = SessionState::Closed;
            changed
        });
        self.cancel_signal.notify_one();
        self.release_observer();
        if was_running {
            debug!(event = "session_canceled", session_id = self.id);
        }
        was_running
    }

    fn release_observer(&self) {
        let released = self.observer.lock().take();
        drop(released);
    }

    /// Runs `f` against the observer unless the session was canceled,
    /// applying `next` first.
    fn notify<F>(&self, next: Option<SessionState>, f: F) -> bool
    where
        F: FnOnce(&dyn SessionObserver),
    {
        let _gate = self.gate.lock();
        if self.is_canceled() {
            return false;
        }
        if let Some(next) = next {
            self.transition(next);
        }
        // Not locked while the callback runs; it may cancel this session.
        let Some(observer) = self.observer.lock().clone() else {
            return false;
        };
        f(observer.as_ref());
        true
    }

    fn activate(&self) -> bool {
        self.notify(Some(SessionState::Active), |observer| observer.on_start())
    }

    fn fail(&self, error: SessionError) {
        warn!(event = "session_failed", session_id = self.id, error = %error);
        self.notify(Some(SessionState::Failed), |observer| {
            observer.on_error(&error)
        });
    }

    fn close_with_error(&self, error: SessionError) {
        self.notify(Some(SessionState::Closed), |observer| {
            observer.on_error(&error)
        });
    }

    /// Classifies one frame and notifies the observer.
    ///
    /// Breaks when the session has ended.
    fn dispatch(&self, frame: Frame) -> ControlFlow<()> {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(bytes) => {
                warn!(
                    event = "session_unexpected_binary_frame",
                    session_id = self.id,
                    len = bytes.len()
                );
                self.close_with_error(SessionError::malformed());
                return ControlFlow::Break(());
            }
        };

        let message = match ServerMessage::classify(&text) {
            Ok(InboundFrame::Message(message)) => message,
            Ok(InboundFrame::Ignored { kind }) => {
                debug!(
                    event = "session_frame_ignored",
                    session_id = self.id,
                    kind = kind.as_deref().unwrap_or("<none>")
                );
                return ControlFlow::Continue(());
            }
            Err(err) => {
                warn!(event = "session_malformed_frame", session_id = self.id, error = %err);
                self.close_with_error(SessionError::malformed());
                return ControlFlow::Break(());
            }
        };

        match message {
            ServerMessage::Progress { progress, step } => {
                if self.notify(None, |observer| observer.on_progress(progress, step)) {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(())
                }
            }
            ServerMessage::Result { data } => {
                info!(event = "session_result", session_id = self.id);
                self.notify(Some(SessionState::Closed), |observer| {
                    observer.on_result(data)
                });
                ControlFlow::Break(())
            }
            ServerMessage::Error { message } => {
                info!(event = "session_server_error", session_id = self.id, message = %message);
                self.close_with_error(SessionError::Server { message });
                ControlFlow::Break(())
            }
        }
    }
}

impl fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCore")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("canceled", &self.is_canceled())
            .finish_non_exhaustive()
    }
}

/// Runs a session from connect to transport release, then drops its
/// observer.
pub(crate) async fn drive<C: Connector>(
    core: Arc<SessionCore>,
    connector: Arc<C>,
    url: String,
    payload: String,
    connect_timeout: Duration,
) {
    connect_and_run(&core, connector.as_ref(), &url, payload, connect_timeout).await;
    core.release_observer();
}

async fn connect_and_run<C: Connector>(
    core: &SessionCore,
    connector: &C,
    url: &str,
    payload: String,
    connect_timeout: Duration,
) {
    let connected = tokio::select! {
        biased;
        _ = core.cancel_signal.notified() => None,
        result = with_timeout(connect_timeout, connector.connect(url)) => Some(result),
    };

    let mut transport = match connected {
        None => {
            debug!(event = "session_canceled_while_connecting", session_id = core.id);
            return;
        }
        Some(Err(_)) => {
            core.fail(SessionError::Transport(format!(
                "connect timed out after {} ms",
                connect_timeout.as_millis()
            )));
            return;
        }
        Some(Ok(Err(err))) => {
            core.fail(SessionError::Transport(err.to_string()));
            return;
        }
        Some(Ok(Ok(transport))) => transport,
    };

    run_connected(core, &mut transport, payload).await;
    transport.close().await;
    debug!(event = "session_transport_closed", session_id = core.id);
}

async fn run_connected<T: Transport>(core: &SessionCore, transport: &mut T, payload: String) {
    if core.is_canceled() {
        return;
    }

    let sent = tokio::select! {
        biased;
        _ = core.cancel_signal.notified() => return,
        sent = transport.send_text(payload) => sent,
    };
    if let Err(err) = sent {
        core.fail(SessionError::Transport(err.to_string()));
        return;
    }
    if !core.activate() {
        return;
    }
    debug!(event = "session_active", session_id = core.id);

    loop {
        let next = tokio::select! {
            biased;
            _ = core.cancel_signal.notified() => return,
            next = transport.next_frame() => next,
        };

        match next {
            Some(Ok(frame)) => {
                if core.dispatch(frame).is_break() {
                    return;
                }
            }
            Some(Err(err)) => {
                core.fail(SessionError::Transport(err.to_string()));
                return;
            }
            None => {
                core.fail(SessionError::Transport(
                    "connection closed before a result was received".to_string(),
                ));
                return;
            }
        }
    }
}

/// Caller-side handle to a started session.
///
/// Dropping the handle does not cancel the session.
pub struct SessionHandle {
    core: Arc<SessionCore>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub(crate) fn new(core: Arc<SessionCore>, task: JoinHandle<()>) -> Self {
        Self { core, task }
    }

    /// Client-unique, monotonically increasing session id.
    pub fn id(&self) -> u64 {
        self.core.id()
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    /// Subscribes to state changes.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.core.state.subscribe()
    }

    /// Whether the driver has released the transport and exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the session. Idempotent; no callback for this session runs
    /// after this returns.
    pub fn cancel(&self) {
        self.core.cancel();
    }

    /// Waits for the driver to exit and returns the final state.
    pub async fn wait(self) -> SessionState {
        if let Err(err) = self.task.await {
            warn!(event = "session_driver_aborted", session_id = self.core.id(), error = %err);
        }
        self.core.state()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("core", &self.core)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::{Mutex, ReentrantMutex};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    use super::{
        drive, SessionCallbacks, SessionCore, SessionError, SessionEvent, SessionState,
        MALFORMED_MESSAGE,
    };
    use crate::stream::client::StreamClientError;
    use crate::stream::proto::GenerationRequest;
    use crate::stream::transport::testing::{mock_pair, MockConnector, MockTransport};
    use crate::stream::transport::Connector;

    const TEST_URL: &str = "ws://mock.local/api/v1/stream/generate/txt2img?token=hf_test";

    fn scenario_payload() -> String {
        GenerationRequest {
            prompt: "cat".to_string(),
            seed: 1,
            height: 512,
            width: 512,
            num_inference_steps: 20,
            guidance_scale: 7.5,
            ..GenerationRequest::default()
        }
        .to_text()
        .expect("encode request")
    }

    fn new_core(
        observer: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<SessionCore> {
        let core = SessionCore::new(1, Box::new(observer), Arc::new(ReentrantMutex::new(())));
        core.begin();
        Arc::new(core)
    }

    fn spawn_with<C: Connector>(
        connector: C,
        connect_timeout: Duration,
    ) -> (
        Arc<SessionCore>,
        mpsc::UnboundedReceiver<SessionEvent>,
        JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let core = new_core(tx);
        let task = tokio::spawn(drive(
            Arc::clone(&core),
            Arc::new(connector),
            TEST_URL.to_string(),
            scenario_payload(),
            connect_timeout,
        ));
        (core, rx, task)
    }

    fn spawn_session(
        transport: MockTransport,
    ) -> (
        Arc<SessionCore>,
        mpsc::UnboundedReceiver<SessionEvent>,
        JoinHandle<()>,
    ) {
        spawn_with(
            MockConnector::with_transports(vec![transport]),
            Duration::from_secs(2),
        )
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("observer channel closed")
    }

    async fn join(task: JoinHandle<()>) {
        timeout(Duration::from_secs(2), task)
            .await
            .expect("timed out waiting for session driver")
            .expect("session driver panicked");
    }

    #[tokio::test]
    async fn progress_then_result_closes_transport_once() {
        let (transport, peer) = mock_pair();
        let (core, mut events, task) = spawn_session(transport);

        assert_eq!(next_event(&mut events).await, SessionEvent::Started);
        assert_eq!(core.state(), SessionState::Active);

        peer.text(r#"{"type":"progress","progress":0.5,"step":10}"#);
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Progress {
                progress: 0.5,
                step: 10
            }
        );

        peer.text(r#"{"type":"result","data":"<base64>"}"#);
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Result {
                data: json!("<base64>")
            }
        );

        peer.text(r#"{"type":"progress","progress":1.0,"step":20}"#);
        join(task).await;

        assert_eq!(core.state(), SessionState::Closed);
        assert_eq!(peer.wire.closes(), 1);
        assert!(events.try_recv().is_err());

        let sent = peer.wire.sent();
        assert_eq!(sent.len(), 1);
        let payload: Value = serde_json::from_str(&sent[0]).expect("payload json");
        assert_eq!(payload["prompt"], "cat");
        assert_eq!(payload["num_inference_steps"], 20);
        assert_eq!(payload["lora_scale"], 0.8);
    }

    #[tokio::test]
    async fn server_error_is_terminal() {
        let (transport, peer) = mock_pair();
        let (core, mut events, task) = spawn_session(transport);

        assert_eq!(next_event(&mut events).await, SessionEvent::Started);
        peer.text(r#"{"type":"error","message":"OOM"}"#);

        match next_event(&mut events).await {
            SessionEvent::Error { error } => {
                assert_eq!(
                    error,
                    SessionError::Server {
                        message: "OOM".to_string()
                    }
                );
                assert_eq!(error.to_string(), "OOM");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        join(task).await;
        assert_eq!(core.state(), SessionState::Closed);
        assert_eq!(peer.wire.closes(), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_frame_reports_protocol_error_and_closes() {
        let (transport, peer) = mock_pair();
        let (core, mut events, task) = spawn_session(transport);

        assert_eq!(next_event(&mut events).await, SessionEvent::Started);
        peer.text("this is not json");

        let event = next_event(&mut events).await;
        assert_eq!(
            event,
            SessionEvent::Error {
                error: SessionError::malformed()
            }
        );
        if let SessionEvent::Error { error } = event {
            assert_eq!(error.to_string(), MALFORMED_MESSAGE);
        }

        join(task).await;
        assert_eq!(core.state(), SessionState::Closed);
        assert_eq!(peer.wire.closes(), 1);
    }

    #[tokio::test]
    async fn known_type_with_bad_fields_is_malformed() {
        let (transport, peer) = mock_pair();
        let (core, mut events, task) = spawn_session(transport);

        assert_eq!(next_event(&mut events).await, SessionEvent::Started);
        peer.text(r#"{"type":"progress","progress":"half"}"#);

        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Error {
                error: SessionError::malformed()
            }
        );
        join(task).await;
        assert_eq!(core.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn binary_frame_is_malformed() {
        let (transport, peer) = mock_pair();
        let (core, mut events, task) = spawn_session(transport);

        assert_eq!(next_event(&mut events).await, SessionEvent::Started);
        peer.binary(&[0x89, 0x50, 0x4e, 0x47]);

        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Error {
                error: SessionError::malformed()
            }
        );
        join(task).await;
        assert_eq!(core.state(), SessionState::Closed);
        assert_eq!(peer.wire.closes(), 1);
    }

    #[tokio::test]
    async fn unknown_message_types_are_skipped() {
        let (transport, peer) = mock_pair();
        let (core, mut events, task) = spawn_session(transport);

        assert_eq!(next_event(&mut events).await, SessionEvent::Started);
        peer.text(r#"{"type":"queue_position","position":3}"#);
        peer.text(r#"{"no_type":true}"#);
        peer.text(r#"{"type":"progress","progress":0.25,"step":5}"#);

        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Progress {
                progress: 0.25,
                step: 5
            }
        );
        assert_eq!(core.state(), SessionState::Active);

        peer.text(r#"{"type":"result","data":{"image_b64":"aW1n"}}"#);
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Result {
                data: json!({"image_b64": "aW1n"})
            }
        );
        join(task).await;
    }

    #[tokio::test]
    async fn progress_order_is_preserved() {
        let (transport, peer) = mock_pair();
        let (_core, mut events, task) = spawn_session(transport);

        for step in 1..=20u64 {
            peer.text(&format!(
                r#"{{"type":"progress","progress":{},"step":{step}}}"#,
                step as f64 / 20.0
            ));
        }
        peer.text(r#"{"type":"result","data":null}"#);

        assert_eq!(next_event(&mut events).await, SessionEvent::Started);
        for expected in 1..=20u64 {
            match next_event(&mut events).await {
                SessionEvent::Progress { step, .. } => assert_eq!(step, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Result { data: Value::Null }
        );
        join(task).await;
    }

    #[tokio::test]
    async fn transport_error_fails_session() {
        let (transport, peer) = mock_pair();
        let (core, mut events, task) = spawn_session(transport);

        assert_eq!(next_event(&mut events).await, SessionEvent::Started);
        peer.fail("connection reset");

        match next_event(&mut events).await {
            SessionEvent::Error {
                error: SessionError::Transport(detail),
            } => assert!(detail.contains("connection reset")),
            other => panic!("unexpected event: {other:?}"),
        }
        join(task).await;
        assert_eq!(core.state(), SessionState::Failed);
        assert_eq!(peer.wire.closes(), 1);
    }

    #[tokio::test]
    async fn peer_hangup_before_result_fails_session() {
        let (transport, peer) = mock_pair();
        let wire = Arc::clone(&peer.wire);
        let (core, mut events, task) = spawn_session(transport);

        assert_eq!(next_event(&mut events).await, SessionEvent::Started);
        drop(peer);

        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Error {
                error: SessionError::Transport(_)
            }
        ));
        join(task).await;
        assert_eq!(core.state(), SessionState::Failed);
        assert_eq!(wire.closes(), 1);
    }

    #[tokio::test]
    async fn connect_failure_never_starts() {
        let (core, mut events, task) =
            spawn_with(MockConnector::default(), Duration::from_secs(2));

        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Error {
                error: SessionError::Transport(_)
            }
        ));
        join(task).await;
        assert_eq!(core.state(), SessionState::Failed);
        assert!(events.try_recv().is_err());
    }

    struct StalledConnector;

    impl Connector for StalledConnector {
        type Transport = MockTransport;

        fn connect(
            &self,
            _url: &str,
        ) -> impl Future<Output = Result<Self::Transport, StreamClientError>> + Send {
            std::future::pending()
        }
    }

    #[tokio::test]
    async fn connect_timeout_fails_session() {
        let (core, mut events, task) = spawn_with(StalledConnector, Duration::from_millis(20));

        match next_event(&mut events).await {
            SessionEvent::Error {
                error: SessionError::Transport(detail),
            } => assert!(detail.contains("timed out")),
            other => panic!("unexpected event: {other:?}"),
        }
        join(task).await;
        assert_eq!(core.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn cancel_while_connecting_is_silent() {
        let (core, mut events, task) = spawn_with(StalledConnector, Duration::from_secs(30));

        assert!(core.cancel());
        assert!(!core.cancel());
        join(task).await;

        assert_eq!(core.state(), SessionState::Closed);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_while_active_drops_queued_frames() {
        let (transport, peer) = mock_pair();
        let (core, mut events, task) = spawn_session(transport);

        assert_eq!(next_event(&mut events).await, SessionEvent::Started);
        peer.text(r#"{"type":"progress","progress":0.1,"step":2}"#);
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Progress { step: 2, .. }
        ));

        core.cancel();
        peer.text(r#"{"type":"progress","progress":0.2,"step":4}"#);
        peer.text(r#"{"type":"result","data":"late"}"#);
        join(task).await;

        assert_eq!(core.state(), SessionState::Closed);
        assert_eq!(peer.wire.closes(), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_after_failure_leaves_session_closed() {
        let (transport, peer) = mock_pair();
        let (core, mut events, task) = spawn_session(transport);

        assert_eq!(next_event(&mut events).await, SessionEvent::Started);
        peer.fail("broken pipe");
        let _ = next_event(&mut events).await;
        join(task).await;

        assert_eq!(core.state(), SessionState::Failed);
        assert!(!core.cancel());
        assert_eq!(core.state(), SessionState::Closed);
        assert_eq!(peer.wire.closes(), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn finished_session_closes_the_observer_channel() {
        let (transport, peer) = mock_pair();
        let (core, mut events, task) = spawn_session(transport);

        assert_eq!(next_event(&mut events).await, SessionEvent::Started);
        peer.text(r#"{"type":"result","data":"done"}"#);
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Result { .. }
        ));

        let closed = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("observer channel left open after the result");
        assert!(closed.is_none());
        join(task).await;
        assert_eq!(core.state(), SessionState::Closed);
        assert!(!core.cancel());
    }

    #[tokio::test]
    async fn cancel_closes_the_observer_channel() {
        let (transport, _peer) = mock_pair();
        let (core, mut events, task) = spawn_session(transport);

        assert_eq!(next_event(&mut events).await, SessionEvent::Started);
        assert!(core.cancel());
        assert!(matches!(
            events.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        join(task).await;
    }

    #[test]
    fn callbacks_observer_forwards_each_notification() {
        use super::SessionObserver;

        let log = Arc::new(Mutex::new(Vec::new()));
        let callbacks = SessionCallbacks::new()
            .with_on_start({
                let log = Arc::clone(&log);
                move || log.lock().push("start".to_string())
            })
            .with_on_progress({
                let log = Arc::clone(&log);
                move |progress, step| log.lock().push(format!("progress {progress} {step}"))
            })
            .with_on_error({
                let log = Arc::clone(&log);
                move |error| log.lock().push(format!("error {error}"))
            });

        callbacks.on_start();
        callbacks.on_progress(0.5, 10);
        callbacks.on_result(json!("ignored without a handler"));
        callbacks.on_error(&SessionError::Server {
            message: "OOM".to_string(),
        });

        assert_eq!(
            *log.lock(),
            vec![
                "start".to_string(),
                "progress 0.5 10".to_string(),
                "error OOM".to_string()
            ]
        );
    }

    #[test]
    fn terminal_states() {
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::Idle.is_terminal());
        assert!(!SessionState::Connecting.is_terminal());
        assert!(!SessionState::Active.is_terminal());
    }
}
