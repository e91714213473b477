use std::sync::{
    Arc, RwLock,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::constants::RECONNECT_DELAY;
use crate::protocol::{ClientRequest, ServerMessage};
use crate::transport::{FrameSink, FrameStream, Transport, WsTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Everything the owner hears from the session, in transport delivery order.
/// The session does not interpret message semantics beyond framing; routing
/// decoded messages into the pixel buffer is the owner's job.
#[derive(Debug, Clone, PartialEq)]
pub enum CanvasEvent {
    Connected,
    Disconnected,
    Message(ServerMessage),
}

#[derive(Debug)]
enum Command {
    Request(ClientRequest),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Lost,
    Shutdown,
}

struct Shared {
    state: RwLock<ConnectionState>,
    dropped_intents: AtomicU64,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap() = state;
    }

    fn drop_intent(&self, request: &ClientRequest) {
        self.dropped_intents.fetch_add(1, Ordering::Relaxed);
        debug!(?request, "dropped intent while disconnected");
    }
}

/// Handle to the session task. Sends are fire-and-forget: while the session
/// is not connected every send is a silent no-op (at most once, no queuing),
/// observable only through [`CanvasClient::dropped_intents`].
#[derive(Clone)]
pub struct CanvasClient {
    command_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl CanvasClient {
    /// Spawn a session against the real WebSocket transport. The session
    /// keeps reconnecting until [`CanvasClient::shutdown`] or until every
    /// handle and the event receiver are gone.
    pub fn connect(url: impl Into<String>) -> (CanvasClient, mpsc::UnboundedReceiver<CanvasEvent>) {
        Self::with_transport(WsTransport, url)
    }

    /// Spawn a session over any transport. Must be called from within a tokio
    /// runtime.
    pub fn with_transport<T: Transport>(
        transport: T,
        url: impl Into<String>,
    ) -> (CanvasClient, mpsc::UnboundedReceiver<CanvasEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: RwLock::new(ConnectionState::Disconnected),
            dropped_intents: AtomicU64::new(0),
        });
        let session = Session {
            transport,
            url: url.into(),
            command_rx,
            event_tx,
            shared: shared.clone(),
        };
        tokio::spawn(session.run());
        (CanvasClient { command_tx, shared }, event_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of sends that were dropped because the session was down.
    pub fn dropped_intents(&self) -> u64 {
        self.shared.dropped_intents.load(Ordering::Relaxed)
    }

    pub fn send_set_pixel(&self, x: u16, y: u16, color: u32) {
        self.submit(ClientRequest::SetPixel {
            x,
            y,
            color,
            skip_echo: false,
        });
    }

    /// Like [`CanvasClient::send_set_pixel`] but asks the authority not to
    /// echo the update back to this client.
    pub fn send_set_pixel_quiet(&self, x: u16, y: u16, color: u32) {
        self.submit(ClientRequest::SetPixel {
            x,
            y,
            color,
            skip_echo: true,
        });
    }

    pub fn request_pixel(&self, x: u16, y: u16) {
        self.submit(ClientRequest::GetPixel { x, y });
    }

    pub fn request_all_pixels(&self) {
        self.submit(ClientRequest::GetAllPixels);
    }

    pub fn request_stats(&self) {
        self.submit(ClientRequest::GetStats);
    }

    /// Close the session for good. The only way the reconnect loop ends.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
    }

    fn submit(&self, request: ClientRequest) {
        if self.state() != ConnectionState::Connected {
            self.shared.drop_intent(&request);
            return;
        }
        if self.command_tx.send(Command::Request(request)).is_err() {
            self.shared.drop_intent(&request);
        }
    }
}

/// The session task: owns the transport, cycles Disconnected → Connecting →
/// Connected → Disconnected forever, resyncing the full canvas on every
/// join.
struct Session<T: Transport> {
    transport: T,
    url: String,
    command_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<CanvasEvent>,
    shared: Arc<Shared>,
}

impl<T: Transport> Session<T> {
    async fn run(mut self) {
        loop {
            self.shared.set_state(ConnectionState::Connecting);
            debug!(url = %self.url, "opening transport");
            match self.transport.connect(&self.url).await {
                Ok((sink, stream)) => {
                    // intents left over from a previous session are stale
                    if self.discard_pending() {
                        return;
                    }
                    self.shared.set_state(ConnectionState::Connected);
                    let _ = self.event_tx.send(CanvasEvent::Connected);
                    let end = serve(&mut self.command_rx, &self.event_tx, sink, stream).await;
                    self.shared.set_state(ConnectionState::Disconnected);
                    let _ = self.event_tx.send(CanvasEvent::Disconnected);
                    if end == SessionEnd::Shutdown {
                        return;
                    }
                }
                Err(error) => {
                    self.shared.set_state(ConnectionState::Disconnected);
                    warn!(%error, url = %self.url, "connection attempt failed");
                }
            }
            if self.wait_for_retry().await {
                return;
            }
        }
    }

    /// Drains queued commands without acting on them. Returns true if a
    /// shutdown was among them.
    fn discard_pending(&mut self) -> bool {
        let mut shutdown = false;
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                Command::Request(request) => self.shared.drop_intent(&request),
                Command::Shutdown => shutdown = true,
            }
        }
        shutdown
    }

    /// Sits out the fixed retry delay. Intents arriving while down are
    /// dropped, never queued for the next session. Returns true on shutdown.
    async fn wait_for_retry(&mut self) -> bool {
        debug!(delay = ?RECONNECT_DELAY, "scheduling reconnect");
        let delay = tokio::time::sleep(RECONNECT_DELAY);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => return false,
                command = self.command_rx.recv() => match command {
                    Some(Command::Request(request)) => self.shared.drop_intent(&request),
                    Some(Command::Shutdown) | None => return true,
                },
            }
        }
    }
}

/// One established connection, from handshake to teardown.
#[instrument(skip_all, fields(session_id = %Uuid::new_v4()))]
async fn serve<S: FrameSink, R: FrameStream>(
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
    event_tx: &mpsc::UnboundedSender<CanvasEvent>,
    mut sink: S,
    mut stream: R,
) -> SessionEnd {
    info!("connected, requesting full canvas");
    // a freshly joined client must never trust its stale buffer
    if let Err(error) = sink.send(ClientRequest::GetAllPixels.encode()).await {
        warn!(%error, "resync request failed");
        return SessionEnd::Lost;
    }

    loop {
        tokio::select! {
            inbound = stream.recv() => match inbound {
                Some(Ok(frame)) => dispatch_frame(event_tx, &frame),
                Some(Err(error)) => {
                    warn!(%error, "transport error");
                    return SessionEnd::Lost;
                }
                None => {
                    info!("connection closed by remote");
                    return SessionEnd::Lost;
                }
            },
            command = command_rx.recv() => match command {
                Some(Command::Request(request)) => {
                    if let Err(error) = sink.send(request.encode()).await {
                        warn!(%error, "send failed, dropping connection");
                        return SessionEnd::Lost;
                    }
                }
                Some(Command::Shutdown) | None => {
                    info!("shutting down session");
                    sink.close().await;
                    return SessionEnd::Shutdown;
                }
            },
        }
    }
}

/// Decode one inbound frame and hand it to the owner. Undecodable frames are
/// logged and dropped; they never tear down the connection.
fn dispatch_frame(event_tx: &mpsc::UnboundedSender<CanvasEvent>, frame: &[u8]) {
    match ServerMessage::decode(frame) {
        Ok(message) => {
            let _ = event_tx.send(CanvasEvent::Message(message));
        }
        Err(error) => warn!(%error, len = frame.len(), "dropping undecodable frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    type Frames = Arc<Mutex<Vec<Vec<u8>>>>;

    struct TestSink {
        sent: Frames,
    }

    #[async_trait::async_trait]
    impl FrameSink for TestSink {
        async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        async fn close(&mut self) {}
    }

    struct TestStream {
        inbound: mpsc::UnboundedReceiver<Result<Vec<u8>, TransportError>>,
    }

    #[async_trait::async_trait]
    impl FrameStream for TestStream {
        async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
            self.inbound.recv().await
        }
    }

    /// Scripted transport: each queued acceptance is consumed by one connect
    /// attempt; once the script runs dry every attempt is refused.
    #[derive(Clone, Default)]
    struct ScriptedTransport {
        accepts: Arc<Mutex<VecDeque<(TestSink, TestStream)>>>,
        attempts: Arc<Mutex<Vec<Instant>>>,
    }

    /// Test-side view of one scripted connection.
    struct Probe {
        sent: Frames,
        inbound: mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>,
    }

    impl ScriptedTransport {
        fn refusing() -> Self {
            Self::default()
        }

        fn accept_next(&self) -> Probe {
            let sent: Frames = Arc::default();
            let (inbound, rx) = mpsc::unbounded_channel();
            self.accepts.lock().unwrap().push_back((
                TestSink { sent: sent.clone() },
                TestStream { inbound: rx },
            ));
            Probe { sent, inbound }
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Transport for ScriptedTransport {
        type Sink = TestSink;
        type Stream = TestStream;

        async fn connect(&self, _url: &str) -> Result<(TestSink, TestStream), TransportError> {
            self.attempts.lock().unwrap().push(Instant::now());
            self.accepts
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TransportError::Connect("connection refused".into()))
        }
    }

    /// Let the session task run until it parks on a timer or channel.
    async fn settle() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<CanvasEvent>) -> Vec<CanvasEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_retries_after_fixed_delay() {
        let transport = ScriptedTransport::refusing();
        let probe = transport.clone();
        let (_client, _events) = CanvasClient::with_transport(transport, "ws://test");

        settle().await;
        assert_eq!(probe.attempts().len(), 1, "one immediate attempt");

        tokio::time::sleep(Duration::from_millis(2999)).await;
        settle().await;
        assert_eq!(probe.attempts().len(), 1, "no retry before the delay");

        tokio::time::sleep(Duration::from_millis(2)).await;
        settle().await;
        let attempts = probe.attempts();
        assert_eq!(attempts.len(), 2, "exactly one retry after the delay");
        assert_eq!(attempts[1] - attempts[0], Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_disconnected_is_a_silent_no_op() {
        let transport = ScriptedTransport::refusing();
        let (client, _events) = CanvasClient::with_transport(transport, "ws://test");
        settle().await;

        assert_eq!(client.state(), ConnectionState::Disconnected);
        client.send_set_pixel(1, 2, 0x123456);
        settle().await;

        assert_eq!(client.dropped_intents(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn join_requests_full_canvas_before_anything_else() {
        let transport = ScriptedTransport::default();
        let probe = transport.accept_next();
        let (client, mut events) = CanvasClient::with_transport(transport, "ws://test");
        settle().await;

        assert!(client.is_connected());
        assert_eq!(drain(&mut events), vec![CanvasEvent::Connected]);
        assert_eq!(*probe.sent.lock().unwrap(), vec![vec![3]]);

        client.send_set_pixel(5, 9, 0xABCDEF);
        settle().await;
        let sent = probe.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[1],
            ClientRequest::SetPixel {
                x: 5,
                y: 9,
                color: 0xABCDEF,
                skip_echo: false
            }
            .encode()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_frames_leave_after_the_connection_drops() {
        let transport = ScriptedTransport::default();
        let probe = transport.accept_next();
        let (client, mut events) = CanvasClient::with_transport(transport, "ws://test");
        settle().await;
        assert!(client.is_connected());

        drop(probe.inbound); // remote closes
        settle().await;

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(
            drain(&mut events),
            vec![CanvasEvent::Connected, CanvasEvent::Disconnected]
        );

        client.send_set_pixel(1, 1, 0xFFFFFF);
        client.request_stats();
        settle().await;

        assert_eq!(*probe.sent.lock().unwrap(), vec![vec![3]], "resync only");
        assert_eq!(client.dropped_intents(), 2);
    }

    #[tracing_test::traced_test]
    #[tokio::test(start_paused = true)]
    async fn undecodable_frame_is_dropped_without_killing_the_session() {
        let transport = ScriptedTransport::default();
        let probe = transport.accept_next();
        let (client, mut events) = CanvasClient::with_transport(transport, "ws://test");
        settle().await;
        drain(&mut events);

        // SET_PIXEL truncated to 2 of its 7 bytes
        probe.inbound.send(Ok(vec![1, 0])).unwrap();
        settle().await;
        assert_eq!(drain(&mut events), vec![]);
        assert!(client.is_connected());
        assert!(logs_contain("dropping undecodable frame"));

        // the session still delivers what follows
        probe
            .inbound
            .send(Ok(vec![1, 0x00, 0x0C, 0x07, 0x11, 0x22, 0x33]))
            .unwrap();
        settle().await;
        assert_eq!(
            drain(&mut events),
            vec![CanvasEvent::Message(ServerMessage::PixelUpdate {
                x: 3,
                y: 7,
                color: 0x112233
            })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resyncs_the_full_canvas_again() {
        let transport = ScriptedTransport::default();
        let first = transport.accept_next();
        let second = transport.accept_next();
        let (client, mut events) = CanvasClient::with_transport(transport, "ws://test");
        settle().await;
        assert!(client.is_connected());

        drop(first.inbound);
        settle().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(3001)).await;
        settle().await;

        assert!(client.is_connected());
        assert_eq!(
            drain(&mut events),
            vec![
                CanvasEvent::Connected,
                CanvasEvent::Disconnected,
                CanvasEvent::Connected
            ]
        );
        assert_eq!(*second.sent.lock().unwrap(), vec![vec![3]]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_the_reconnect_loop() {
        let transport = ScriptedTransport::default();
        let _probe = transport.accept_next();
        let probe_transport = transport.clone();
        let (client, mut events) = CanvasClient::with_transport(transport, "ws://test");
        settle().await;
        assert!(client.is_connected());

        client.shutdown();
        settle().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(
            drain(&mut events),
            vec![CanvasEvent::Connected, CanvasEvent::Disconnected]
        );

        // no further attempts, ever
        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(probe_transport.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_messages_reach_the_owner_in_order() {
        let transport = ScriptedTransport::default();
        let probe = transport.accept_next();
        let (_client, mut events) = CanvasClient::with_transport(transport, "ws://test");
        settle().await;
        drain(&mut events);

        let mut stats = vec![13];
        stats.extend_from_slice(&7u32.to_be_bytes());
        stats.extend_from_slice(&0.5f32.to_be_bytes());
        probe.inbound.send(Ok(stats)).unwrap();
        probe.inbound.send(Ok(vec![11, 2])).unwrap();
        settle().await;

        assert_eq!(
            drain(&mut events),
            vec![
                CanvasEvent::Message(ServerMessage::Stats {
                    connected_clients: 7,
                    requests_per_second: 0.5
                }),
                CanvasEvent::Message(ServerMessage::Error {
                    code: crate::protocol::ErrorCode::OutOfBounds
                }),
            ]
        );
    }
}
