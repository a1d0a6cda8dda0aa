//! Stream endpoint: TCP-framed sessions. Each frame is
//! `{kind: u8, slot: u16, length: u32, payload}` big-endian; control frames
//! carry the session-bye exchange. One session worker per accepted
//! connection; responses flush synchronously, so the stream side never has
//! incomplete result sets.

use crate::endpoint::{
    Endpoint, HandshakeRequest, HandshakeResponse, WorkerCommon, decode_request_payload,
    encode_request_payload,
};
use crate::error::ForecourtError;
use crate::service::{
    DataChannel, DataWriter, DatabaseInfo, DiagnosticCode, Diagnostics, Request, Response,
    ResponseCode, ResponseWriteState, RoutingChainOutcome, RoutingService,
    SERVICE_ID_ENDPOINT_BROKER, SERVICE_ID_ROUTING, Service,
};
use crate::session::{ConnectionType, SessionsCore, ShutdownRequest};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const MAX_FRAME_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Interval of the worker's internal read timeout that produces the
/// housekeeping `Timeout` arm.
const AWAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Payload,
    BodyHead,
    Body,
    Diagnostic,
    ChannelData,
    SessionBye,
    SessionByeOk,
}

impl FrameKind {
    fn to_u8(self) -> u8 {
        match self {
            FrameKind::Payload => 1,
            FrameKind::BodyHead => 2,
            FrameKind::Body => 3,
            FrameKind::Diagnostic => 4,
            FrameKind::ChannelData => 5,
            FrameKind::SessionBye => 6,
            FrameKind::SessionByeOk => 7,
        }
    }

    fn from_u8(raw: u8) -> Result<Self, ForecourtError> {
        match raw {
            1 => Ok(FrameKind::Payload),
            2 => Ok(FrameKind::BodyHead),
            3 => Ok(FrameKind::Body),
            4 => Ok(FrameKind::Diagnostic),
            5 => Ok(FrameKind::ChannelData),
            6 => Ok(FrameKind::SessionBye),
            7 => Ok(FrameKind::SessionByeOk),
            other => Err(ForecourtError::TransportFraming(format!(
                "unknown frame kind {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub slot: u16,
    pub payload: Vec<u8>,
}

pub fn write_frame(
    out: &mut impl Write,
    kind: FrameKind,
    slot: u16,
    payload: &[u8],
) -> Result<(), ForecourtError> {
    let length = u32::try_from(payload.len())
        .map_err(|_| ForecourtError::TransportFraming("frame payload too large".into()))?;
    out.write_all(&[kind.to_u8()])?;
    out.write_all(&slot.to_be_bytes())?;
    out.write_all(&length.to_be_bytes())?;
    out.write_all(payload)?;
    out.flush()?;
    Ok(())
}

/// Reads one frame. `Ok(None)` is a clean end of stream at a frame
/// boundary. A read timeout before the first header byte surfaces as the
/// underlying `Io` error; once a frame has started, reads retry through
/// timeouts so a slow sender cannot shear a frame in half.
pub fn read_frame(input: &mut impl Read) -> Result<Option<Frame>, ForecourtError> {
    let mut kind_buf = [0u8; 1];
    match input.read(&mut kind_buf) {
        Ok(0) => return Ok(None),
        Ok(_) => {}
        Err(err) => return Err(ForecourtError::Io(err)),
    }
    let kind = FrameKind::from_u8(kind_buf[0])?;
    let mut header = [0u8; 6];
    read_exact_through_timeouts(input, &mut header)?;
    let slot = u16::from_be_bytes(
        header[0..2]
            .try_into()
            .map_err(|_| ForecourtError::TransportFraming("unreadable slot".into()))?,
    );
    let length = u32::from_be_bytes(
        header[2..6]
            .try_into()
            .map_err(|_| ForecourtError::TransportFraming("unreadable length".into()))?,
    ) as usize;
    if length > MAX_FRAME_PAYLOAD_BYTES {
        return Err(ForecourtError::TransportFraming(format!(
            "frame payload of {length} bytes exceeds the limit"
        )));
    }
    let mut payload = vec![0u8; length];
    read_exact_through_timeouts(input, &mut payload)?;
    Ok(Some(Frame {
        kind,
        slot,
        payload,
    }))
}

fn read_exact_through_timeouts(
    input: &mut impl Read,
    buffer: &mut [u8],
) -> Result<(), ForecourtError> {
    let mut filled = 0;
    while filled < buffer.len() {
        match input.read(&mut buffer[filled..]) {
            Ok(0) => {
                return Err(ForecourtError::TransportFraming(
                    "stream ended inside a frame".into(),
                ));
            }
            Ok(n) => filled += n,
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => return Err(ForecourtError::Io(err)),
        }
    }
    Ok(())
}

/// Outcome of one `await_message` call on a session stream.
#[derive(Debug)]
pub enum AwaitResult {
    Payload { slot: u16, payload: Vec<u8> },
    Timeout,
    TerminationRequest,
    Error(ForecourtError),
}

/// Server half of one TCP session.
pub struct StreamSocket {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    peer: String,
    closed: AtomicBool,
}

impl StreamSocket {
    pub fn new(stream: TcpStream) -> Result<Self, ForecourtError> {
        stream.set_read_timeout(Some(AWAIT_POLL_INTERVAL))?;
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
            peer,
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Blocks up to the internal poll interval for the next inbound frame.
    pub fn await_message(&self) -> AwaitResult {
        let mut reader = self.reader.lock();
        match read_frame(&mut *reader) {
            Ok(Some(frame)) => match frame.kind {
                FrameKind::Payload => AwaitResult::Payload {
                    slot: frame.slot,
                    payload: frame.payload,
                },
                FrameKind::SessionBye => AwaitResult::TerminationRequest,
                other => AwaitResult::Error(ForecourtError::TransportFraming(format!(
                    "client sent unexpected frame kind {other:?}"
                ))),
            },
            Ok(None) => AwaitResult::Error(ForecourtError::TransportClosed),
            Err(ForecourtError::Io(err))
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                AwaitResult::Timeout
            }
            Err(err) => AwaitResult::Error(err),
        }
    }

    pub fn send(&self, kind: FrameKind, slot: u16, payload: &[u8]) -> Result<(), ForecourtError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ForecourtError::TransportClosed);
        }
        write_frame(&mut *self.writer.lock(), kind, slot, payload)
    }

    pub fn send_session_bye_ok(&self) -> Result<(), ForecourtError> {
        self.send(FrameKind::SessionByeOk, 0, &[])
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.writer.lock().shutdown(Shutdown::Both);
        }
    }
}

/// Response writing frames back onto the session stream on one slot.
pub(crate) struct StreamResponse {
    socket: Arc<StreamSocket>,
    slot: u16,
    session_id: AtomicU64,
    write_state: ResponseWriteState,
    cancelled: AtomicBool,
    channels: Mutex<HashMap<String, Arc<StreamDataChannel>>>,
}

impl StreamResponse {
    pub(crate) fn new(socket: Arc<StreamSocket>, slot: u16) -> Self {
        Self {
            socket,
            slot,
            session_id: AtomicU64::new(crate::service::SESSION_ID_UNKNOWN),
            write_state: ResponseWriteState::default(),
            cancelled: AtomicBool::new(false),
            channels: Mutex::new(HashMap::new()),
        }
    }
}

impl Response for StreamResponse {
    fn set_session_id(&self, id: u64) {
        self.session_id.store(id, Ordering::Release);
    }

    fn set_code(&self, _code: ResponseCode) {}

    fn body_head(&self, data: &[u8]) -> Result<(), ForecourtError> {
        self.write_state.claim_body_head()?;
        self.socket.send(FrameKind::BodyHead, self.slot, data)
    }

    fn body(&self, data: &[u8]) -> Result<(), ForecourtError> {
        self.write_state.claim_body()?;
        self.socket.send(FrameKind::Body, self.slot, data)
    }

    fn error(&self, record: Diagnostics) {
        self.write_state.mark_error();
        let payload = serde_json::to_vec(&record).unwrap_or_default();
        if let Err(err) = self.socket.send(FrameKind::Diagnostic, self.slot, &payload) {
            trace!(error = %err, "diagnostics frame not delivered");
        }
    }

    fn acquire_channel(&self, name: &str) -> Result<Arc<dyn DataChannel>, ForecourtError> {
        let mut channels = self.channels.lock();
        if channels.contains_key(name) {
            return Err(ForecourtError::ServiceError(format!(
                "channel '{name}' already acquired"
            )));
        }
        let channel = Arc::new(StreamDataChannel {
            name: name.to_string(),
            socket: Arc::clone(&self.socket),
            slot: self.slot,
            writers: Mutex::new(Vec::new()),
        });
        channels.insert(name.to_string(), Arc::clone(&channel));
        Ok(channel)
    }

    fn release_channel(&self, channel: Arc<dyn DataChannel>) -> Result<(), ForecourtError> {
        self.channels
            .lock()
            .remove(channel.name())
            .map(|_| ())
            .ok_or_else(|| {
                ForecourtError::ServiceError(format!(
                    "channel '{}' is not acquired",
                    channel.name()
                ))
            })
    }

    fn is_completed(&self) -> bool {
        self.write_state.is_completed()
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Stream result-set channel: committed data is flushed onto the wire
/// immediately, so nothing survives a writer past its commit.
pub(crate) struct StreamDataChannel {
    name: String,
    socket: Arc<StreamSocket>,
    slot: u16,
    writers: Mutex<Vec<Arc<StreamDataWriter>>>,
}

impl DataChannel for StreamDataChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn acquire_writer(&self) -> Result<Arc<dyn DataWriter>, ForecourtError> {
        let writer = Arc::new(StreamDataWriter {
            channel_name: self.name.clone(),
            socket: Arc::clone(&self.socket),
            slot: self.slot,
            buffer: Mutex::new(Vec::new()),
        });
        self.writers.lock().push(Arc::clone(&writer));
        Ok(writer)
    }

    fn release_writer(&self, writer: Arc<dyn DataWriter>) -> Result<(), ForecourtError> {
        let mut writers = self.writers.lock();
        let position = writers
            .iter()
            .position(|held| Arc::ptr_eq(&(Arc::clone(held) as Arc<dyn DataWriter>), &writer))
            .ok_or_else(|| {
                ForecourtError::ServiceError("writer does not belong to this channel".into())
            })?;
        writers.remove(position);
        Ok(())
    }
}

pub(crate) struct StreamDataWriter {
    channel_name: String,
    socket: Arc<StreamSocket>,
    slot: u16,
    buffer: Mutex<Vec<u8>>,
}

impl DataWriter for StreamDataWriter {
    fn write(&self, data: &[u8]) -> Result<(), ForecourtError> {
        self.buffer.lock().extend_from_slice(data);
        Ok(())
    }

    fn commit(&self) -> Result<(), ForecourtError> {
        let chunk = std::mem::take(&mut *self.buffer.lock());
        if chunk.is_empty() {
            return Ok(());
        }
        let name_bytes = self.channel_name.as_bytes();
        let name_len = u8::try_from(name_bytes.len())
            .map_err(|_| ForecourtError::ServiceError("channel name too long".into()))?;
        let mut payload = Vec::with_capacity(1 + name_bytes.len() + chunk.len());
        payload.push(name_len);
        payload.extend_from_slice(name_bytes);
        payload.extend_from_slice(&chunk);
        self.socket.send(FrameKind::ChannelData, self.slot, &payload)
    }
}

/// Payload of an endpoint-broker request; currently cancel only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum BrokerCommand {
    Cancel { slot: u16 },
}

struct StreamWorker {
    common: WorkerCommon,
    routing: Arc<RoutingService>,
    socket: Arc<StreamSocket>,
    decline: bool,
    expiration: Option<Duration>,
    expiration_base: Mutex<Instant>,
}

impl StreamWorker {
    #[allow(clippy::too_many_arguments)]
    fn new(
        routing: Arc<RoutingService>,
        session_id: u64,
        socket: Arc<StreamSocket>,
        database_info: Arc<DatabaseInfo>,
        sessions: Arc<SessionsCore>,
        decline: bool,
        expiration: Option<Duration>,
    ) -> Self {
        let connection_info = socket.peer().to_string();
        Self {
            common: WorkerCommon::new(
                ConnectionType::Stream,
                session_id,
                connection_info,
                database_info,
                sessions,
            ),
            routing,
            socket,
            decline,
            expiration,
            expiration_base: Mutex::new(Instant::now()),
        }
    }

    fn run(&self) {
        if self.establish() {
            self.serve();
        }
        self.socket.close();
        self.common.dispose_session_store();
        debug!(session_id = self.common.session_id(), "stream session finished");
    }

    /// Pre-dispatch phase: the decline path for over-capacity connections,
    /// otherwise the handshake.
    fn establish(&self) -> bool {
        loop {
            match self.socket.await_message() {
                AwaitResult::Payload { slot, payload } => {
                    if self.decline {
                        let response = StreamResponse::new(Arc::clone(&self.socket), slot);
                        self.common.notify_client(
                            &response,
                            DiagnosticCode::ResourceLimitReached,
                            "the server reached the maximum number of sessions",
                        );
                        trace!(
                            session_id = self.common.session_id(),
                            "session declined at capacity"
                        );
                        return false;
                    }
                    let body = match decode_request_payload(&payload) {
                        Ok((_, body)) => body.to_vec(),
                        Err(err) => {
                            warn!(
                                session_id = self.common.session_id(),
                                error = %err,
                                "handshake framing error"
                            );
                            return false;
                        }
                    };
                    let request = self.common.make_request(SERVICE_ID_ROUTING, body);
                    let response = StreamResponse::new(Arc::clone(&self.socket), slot);
                    return self.common.handshake(&*request, &response);
                }
                AwaitResult::Timeout => continue,
                _ => {
                    trace!(
                        session_id = self.common.session_id(),
                        "shutdown request before handshake"
                    );
                    return false;
                }
            }
        }
    }

    fn serve(&self) {
        let mut expiration_notified = false;
        loop {
            match self.socket.await_message() {
                AwaitResult::Payload { slot, payload } => {
                    if !self.dispatch(slot, payload) {
                        break;
                    }
                }
                AwaitResult::Timeout => {
                    self.common.care_reqreses();
                    if self.common.check_shutdown_request() != ShutdownRequest::None
                        && self.common.is_completed()
                        && !self.has_incomplete_resultset()
                    {
                        self.common.shutdown_complete();
                        if !self.common.shutdown_from_client() {
                            break;
                        }
                    }
                    if self.is_expiration_time_over() && !expiration_notified {
                        self.common.request_shutdown(ShutdownRequest::Forceful);
                        expiration_notified = true;
                    }
                }
                AwaitResult::TerminationRequest => {
                    let already_from_client = self.common.shutdown_from_client();
                    if !already_from_client {
                        self.common.mark_shutdown_from_client();
                        self.common.request_shutdown(ShutdownRequest::Forceful);
                    }
                    let _ = self.socket.send_session_bye_ok();
                    break;
                }
                AwaitResult::Error(err) => {
                    trace!(
                        session_id = self.common.session_id(),
                        error = %err,
                        "session stream ended"
                    );
                    break;
                }
            }
        }
    }

    /// Routes one framed request through the broker/routing/default chains.
    /// False tells the serve loop to terminate the worker.
    fn dispatch(&self, slot: u16, payload: Vec<u8>) -> bool {
        let (service_id, body) = match decode_request_payload(&payload) {
            Ok(decoded) => (decoded.0, decoded.1.to_vec()),
            Err(err) => {
                warn!(
                    session_id = self.common.session_id(),
                    error = %err,
                    "dropping unreadable request frame"
                );
                return true;
            }
        };
        let request = self.common.make_request(service_id, body);
        let response: Arc<dyn Response> =
            Arc::new(StreamResponse::new(Arc::clone(&self.socket), slot));
        match service_id {
            SERVICE_ID_ENDPOINT_BROKER => self.endpoint_service(&request, &response),
            SERVICE_ID_ROUTING => {
                self.common.register_reqres(
                    slot,
                    Arc::clone(&request) as Arc<dyn Request>,
                    Arc::clone(&response),
                );
                // two tiers: the routing-service chain first, then the
                // general service when the chain declines
                let keep_going = match self.routing.route_chain(
                    Arc::clone(&request) as Arc<dyn Request>,
                    Arc::clone(&response),
                ) {
                    RoutingChainOutcome::Handled { keep_going } => {
                        // chain traffic is session control; it keeps the
                        // session alive
                        self.refresh_expiration();
                        keep_going
                    }
                    RoutingChainOutcome::Declined => self.routing.call(request, response),
                };
                self.after_dispatch(keep_going)
            }
            _ => {
                if self.common.check_shutdown_request() != ShutdownRequest::None {
                    self.common.notify_client(
                        &*response,
                        DiagnosticCode::SessionClosed,
                        "this session is already shutdown",
                    );
                    return true;
                }
                self.common.register_reqres(
                    slot,
                    Arc::clone(&request) as Arc<dyn Request>,
                    Arc::clone(&response),
                );
                let keep_going = self.routing.call(request, response);
                self.after_dispatch(keep_going)
            }
        }
    }

    fn after_dispatch(&self, keep_going: bool) -> bool {
        self.common.care_reqreses();
        if self.common.check_shutdown_request() != ShutdownRequest::None
            && self.common.is_completed()
            && !self.has_incomplete_resultset()
        {
            self.common.shutdown_complete();
        }
        if !keep_going {
            info!(
                session_id = self.common.session_id(),
                "terminate worker because service returned an error"
            );
        }
        keep_going
    }

    /// Handled inside the endpoint worker; currently cancel only.
    fn endpoint_service(
        &self,
        request: &Arc<crate::endpoint::EndpointRequest>,
        response: &Arc<dyn Response>,
    ) -> bool {
        match serde_json::from_slice::<BrokerCommand>(request.payload()) {
            Ok(BrokerCommand::Cancel { slot }) => {
                if let Some(target) = self.common.find_response(slot) {
                    target.cancel();
                }
                response.set_session_id(self.common.session_id());
                if response.body(b"{}").is_err() {
                    return false;
                }
                true
            }
            Err(err) => {
                self.common.notify_client(
                    &**response,
                    DiagnosticCode::IllegalState,
                    format!("malformed endpoint broker command: {err}"),
                );
                true
            }
        }
    }

    /// Stream responses flush synchronously, so nothing can be left behind.
    fn has_incomplete_resultset(&self) -> bool {
        false
    }

    fn refresh_expiration(&self) {
        *self.expiration_base.lock() = Instant::now();
    }

    fn is_expiration_time_over(&self) -> bool {
        self.expiration
            .map(|limit| self.expiration_base.lock().elapsed() > limit)
            .unwrap_or(false)
    }
}

/// Stream endpoint component: TCP listener plus per-session workers.
pub struct StreamEndpoint {
    port: u16,
    max_sessions: usize,
    routing: Arc<RoutingService>,
    sessions: Arc<SessionsCore>,
    database_info: Arc<DatabaseInfo>,
    session_expiration: Option<Duration>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown_flag: Arc<AtomicBool>,
    live_sessions: Arc<AtomicUsize>,
    listener_thread: Mutex<Option<JoinHandle<()>>>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl StreamEndpoint {
    pub fn new(
        config: &crate::config::StreamEndpointConfig,
        routing: Arc<RoutingService>,
        sessions: Arc<SessionsCore>,
        database_info: Arc<DatabaseInfo>,
    ) -> Self {
        Self {
            port: config.port,
            max_sessions: config.threads,
            routing,
            sessions,
            database_info,
            session_expiration: None,
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            live_sessions: Arc::new(AtomicUsize::new(0)),
            listener_thread: Mutex::new(None),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Sessions idle past this duration are forcefully shut down by the
    /// worker's housekeeping arm.
    pub fn set_session_expiration(&mut self, expiration: Option<Duration>) {
        self.session_expiration = expiration;
    }

    /// Address the endpoint is bound to, available after `setup`. Lets
    /// tests bind port 0 and discover the ephemeral port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

impl Endpoint for StreamEndpoint {
    fn label(&self) -> &str {
        "stream_endpoint"
    }

    fn setup(&self) -> Result<(), ForecourtError> {
        let listener = TcpListener::bind(("127.0.0.1", self.port))?;
        *self.local_addr.lock() = Some(listener.local_addr()?);
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    fn start(&self) -> Result<(), ForecourtError> {
        if self.listener.lock().is_none() {
            self.setup()?;
        }
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| ForecourtError::ServiceError("stream endpoint not set up".into()))?;
        let routing = Arc::clone(&self.routing);
        let sessions = Arc::clone(&self.sessions);
        let database_info = Arc::clone(&self.database_info);
        let shutdown_flag = Arc::clone(&self.shutdown_flag);
        let live_sessions = Arc::clone(&self.live_sessions);
        let workers = Arc::clone(&self.workers);
        let max_sessions = self.max_sessions;
        let expiration = self.session_expiration;
        let handle = std::thread::Builder::new()
            .name("forecourt-stream-listener".to_string())
            .spawn(move || {
                accept_loop(
                    listener,
                    routing,
                    sessions,
                    database_info,
                    shutdown_flag,
                    live_sessions,
                    workers,
                    max_sessions,
                    expiration,
                )
            })?;
        *self.listener_thread.lock() = Some(handle);
        info!(addr = ?self.local_addr(), "stream endpoint started");
        Ok(())
    }

    fn shutdown(&self) -> Result<(), ForecourtError> {
        self.shutdown_flag.store(true, Ordering::Release);
        // unblock the accept call
        if let Some(addr) = self.local_addr() {
            let _ = TcpStream::connect(addr);
        }
        if let Some(handle) = self.listener_thread.lock().take() {
            let _ = handle.join();
        }
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        info!("stream endpoint stopped");
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn accept_loop(
    listener: TcpListener,
    routing: Arc<RoutingService>,
    sessions: Arc<SessionsCore>,
    database_info: Arc<DatabaseInfo>,
    shutdown_flag: Arc<AtomicBool>,
    live_sessions: Arc<AtomicUsize>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    max_sessions: usize,
    expiration: Option<Duration>,
) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                if shutdown_flag.load(Ordering::Acquire) {
                    break;
                }
                warn!(error = %err, "stream accept failed");
                continue;
            }
        };
        if shutdown_flag.load(Ordering::Acquire) {
            break;
        }
        let socket = match StreamSocket::new(stream) {
            Ok(socket) => Arc::new(socket),
            Err(err) => {
                warn!(error = %err, "could not prepare session socket");
                continue;
            }
        };
        let decline = live_sessions.load(Ordering::Acquire) >= max_sessions;
        let session_id = crate::session::next_session_id();
        debug!(session_id, %peer, decline, "accepted stream connection");
        live_sessions.fetch_add(1, Ordering::AcqRel);
        let worker = StreamWorker::new(
            Arc::clone(&routing),
            session_id,
            socket,
            Arc::clone(&database_info),
            Arc::clone(&sessions),
            decline,
            expiration,
        );
        let live = Arc::clone(&live_sessions);
        let handle = std::thread::Builder::new()
            .name(format!("forecourt-stream-session-{session_id}"))
            .spawn(move || {
                worker.run();
                live.fetch_sub(1, Ordering::AcqRel);
            });
        match handle {
            Ok(handle) => {
                let mut workers = workers.lock();
                workers.retain(|held| !held.is_finished());
                workers.push(handle);
            }
            Err(err) => {
                live_sessions.fetch_sub(1, Ordering::AcqRel);
                warn!(session_id, error = %err, "failed to spawn stream session worker");
            }
        }
    }
}

/// Client half of a stream session, for tests and in-process tooling.
pub struct StreamClient {
    stream: Mutex<TcpStream>,
}

impl StreamClient {
    pub fn connect(addr: SocketAddr) -> Result<Self, ForecourtError> {
        let stream = TcpStream::connect(addr)?;
        Ok(Self {
            stream: Mutex::new(stream),
        })
    }

    pub fn handshake(&self, message: &HandshakeRequest) -> Result<u64, ForecourtError> {
        let body = serde_json::to_vec(message)
            .map_err(|err| ForecourtError::HandshakeFailed(err.to_string()))?;
        self.send_request(0, SERVICE_ID_ROUTING, &body)?;
        let frame = self.recv()?;
        match frame.kind {
            FrameKind::Body => {
                let decoded: HandshakeResponse = serde_json::from_slice(&frame.payload)
                    .map_err(|err| ForecourtError::HandshakeFailed(err.to_string()))?;
                Ok(decoded.session_id)
            }
            FrameKind::Diagnostic => Err(ForecourtError::HandshakeFailed(
                String::from_utf8_lossy(&frame.payload).into_owned(),
            )),
            other => Err(ForecourtError::TransportFraming(format!(
                "unexpected handshake reply kind {other:?}"
            ))),
        }
    }

    pub fn send_request(
        &self,
        slot: u16,
        service_id: u32,
        body: &[u8],
    ) -> Result<(), ForecourtError> {
        let payload = encode_request_payload(service_id, body);
        write_frame(&mut *self.stream.lock(), FrameKind::Payload, slot, &payload)
    }

    pub fn send_session_bye(&self) -> Result<(), ForecourtError> {
        write_frame(&mut *self.stream.lock(), FrameKind::SessionBye, 0, &[])
    }

    /// Blocks for the next frame from the server.
    pub fn recv(&self) -> Result<Frame, ForecourtError> {
        let mut stream = self.stream.lock();
        loop {
            match read_frame(&mut *stream) {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => return Err(ForecourtError::TransportClosed),
                Err(ForecourtError::Io(err))
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut => {}
                Err(err) => return Err(err),
            }
        }
    }
}
