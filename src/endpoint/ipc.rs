//! IPC endpoint: a connection queue admitting at most
//! `threads + admin_sessions` concurrent sessions, a request/response wire
//! pair per session, a listener thread, and one session worker per accepted
//! connection.
//!
//! The byte-level shared-memory packing of the wire is an external
//! collaborator; this module reproduces its semantics (header peep, slot
//! sentinel, close flag, `<database_name>-<session_id>` naming) over
//! in-process buffers.

use crate::endpoint::{
    Endpoint, HandshakeRequest, HandshakeResponse, WorkerCommon, decode_request_payload,
    encode_request_payload,
};
use crate::error::ForecourtError;
use crate::service::{
    DataChannel, DataWriter, DatabaseInfo, DiagnosticCode, Diagnostics, Request, Response,
    ResponseCode, ResponseWriteState, RoutingService, SERVICE_ID_ROUTING, Service,
};
use crate::session::{ConnectionType, SessionsCore, ShutdownRequest, next_session_id};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Slot value marking a header that carries no request; combined with a
/// zero length it means "session closing".
pub const SLOT_NOT_USE: u16 = u16::MAX;

/// Session id a rejected or terminated connect request observes.
pub const CONNECTION_REJECTED: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub length: u32,
    pub slot: u16,
}

impl RequestHeader {
    pub fn is_session_close(&self) -> bool {
        self.length == 0 && self.slot == SLOT_NOT_USE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    BodyHead,
    Body,
    Diagnostic,
    ChannelData,
}

/// One message on the response wire of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMessage {
    pub slot: u16,
    pub kind: ResponseKind,
    pub channel: Option<String>,
    pub payload: Vec<u8>,
}

struct RequestMessage {
    slot: u16,
    payload: Vec<u8>,
}

struct MessageQueue<T> {
    queue: Mutex<VecDeque<T>>,
    cv: Condvar,
}

impl<T> MessageQueue<T> {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        }
    }

    fn push(&self, message: T) {
        self.queue.lock().push_back(message);
        self.cv.notify_all();
    }

    fn pop(&self, blocking: bool) -> Option<T> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(message) = queue.pop_front() {
                return Some(message);
            }
            if !blocking {
                return None;
            }
            self.cv.wait(&mut queue);
        }
    }
}

/// Counts result-set channels handed out on a wire and not yet released.
#[derive(Default)]
pub(crate) struct ResultSetGc {
    live: AtomicUsize,
}

impl ResultSetGc {
    fn register(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    fn collect(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn all_collected(&self) -> bool {
        self.live.load(Ordering::Acquire) == 0
    }
}

/// Request/response wire pair of one session. The server peeps request
/// headers; the client reads slot-tagged response messages.
pub struct ServerWire {
    name: String,
    requests: MessageQueue<RequestMessage>,
    responses: MessageQueue<ResponseMessage>,
    session_closed: AtomicBool,
    gc: ResultSetGc,
}

impl ServerWire {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requests: MessageQueue::new(),
            responses: MessageQueue::new(),
            session_closed: AtomicBool::new(false),
            gc: ResultSetGc::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next request header and payload; blocks until one arrives when
    /// `blocking` is set. A close header has zero length and the
    /// `SLOT_NOT_USE` slot.
    pub fn peep(&self, blocking: bool) -> Option<(RequestHeader, Vec<u8>)> {
        self.requests.pop(blocking).map(|message| {
            (
                RequestHeader {
                    length: message.payload.len() as u32,
                    slot: message.slot,
                },
                message.payload,
            )
        })
    }

    pub fn is_session_closed(&self) -> bool {
        self.session_closed.load(Ordering::Acquire)
    }

    /// Marks the session closed and wakes a blocked `peep` with the close
    /// header. Called from the client side on disconnect and from the
    /// endpoint on terminate.
    pub fn close_session(&self) {
        self.session_closed.store(true, Ordering::Release);
        self.requests.push(RequestMessage {
            slot: SLOT_NOT_USE,
            payload: Vec::new(),
        });
    }

    // client side

    pub fn send_request(&self, slot: u16, service_id: u32, body: &[u8]) {
        self.requests.push(RequestMessage {
            slot,
            payload: encode_request_payload(service_id, body),
        });
    }

    pub fn receive_response(&self, blocking: bool) -> Option<ResponseMessage> {
        self.responses.pop(blocking)
    }

    fn send_response(&self, message: ResponseMessage) {
        self.responses.push(message);
    }

    pub(crate) fn gc(&self) -> &ResultSetGc {
        &self.gc
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    /// Connect request issued, not yet seen by the listener.
    Requested,
    /// Returned from `listen`, awaiting accept or reject.
    Listened,
    /// Accept/reject decision published, awaiting the client's `wait`.
    Decided(u64),
    /// Session running; the slot is occupied until release.
    Active,
}

struct SlotEntry {
    state: SlotState,
    ticket: u64,
}

struct QueueInner {
    slots: Vec<SlotEntry>,
    normal_slots: usize,
    pending: VecDeque<usize>,
    next_ticket: u64,
    current_slot: usize,
    terminated: bool,
    terminate_confirmed: bool,
}

/// Bounded queue of pending connect requests. Capacity is
/// `threads + admin_sessions`; exceeding the per-class budget fails the
/// request with a resource error.
pub struct ConnectionQueue {
    inner: Mutex<QueueInner>,
    listener_cv: Condvar,
    client_cv: Condvar,
}

impl ConnectionQueue {
    pub fn new(threads: usize, admin_sessions: usize) -> Self {
        let total = threads + admin_sessions;
        Self {
            inner: Mutex::new(QueueInner {
                slots: (0..total)
                    .map(|_| SlotEntry {
                        state: SlotState::Free,
                        ticket: 0,
                    })
                    .collect(),
                normal_slots: threads,
                pending: VecDeque::new(),
                next_ticket: 1,
                current_slot: 0,
                terminated: false,
                terminate_confirmed: false,
            }),
            listener_cv: Condvar::new(),
            client_cv: Condvar::new(),
        }
    }

    /// Issues a connect request against the normal session budget; the
    /// returned ticket is redeemed with `wait`.
    pub fn request(&self) -> Result<u64, ForecourtError> {
        self.request_in(false)
    }

    /// Issues a connect request against the reserved admin budget.
    pub fn request_admin(&self) -> Result<u64, ForecourtError> {
        self.request_in(true)
    }

    fn request_in(&self, admin: bool) -> Result<u64, ForecourtError> {
        let mut inner = self.inner.lock();
        if inner.terminated {
            return Err(ForecourtError::ShutdownInProgress);
        }
        let mut range = if admin {
            inner.normal_slots..inner.slots.len()
        } else {
            0..inner.normal_slots
        };
        let slot = range
            .find(|&idx| inner.slots[idx].state == SlotState::Free)
            .ok_or_else(|| {
                ForecourtError::ResourceLimitReached(if admin {
                    "no admin session slot available".into()
                } else {
                    "no session slot available".into()
                })
            })?;
        let ticket = inner.next_ticket;
        inner.next_ticket += 1;
        inner.slots[slot] = SlotEntry {
            state: SlotState::Requested,
            ticket,
        };
        inner.pending.push_back(slot);
        self.listener_cv.notify_all();
        Ok(ticket)
    }

    /// Blocks until a connect request arrives or a terminate is delivered,
    /// returning the session id assigned to the request. After a terminate
    /// the caller must check `is_terminated`.
    pub fn listen(&self) -> u64 {
        let mut inner = self.inner.lock();
        loop {
            if inner.terminated {
                return 0;
            }
            if let Some(slot) = inner.pending.pop_front() {
                let session_id = next_session_id();
                inner.slots[slot].state = SlotState::Listened;
                inner.current_slot = slot;
                return session_id;
            }
            self.listener_cv.wait(&mut inner);
        }
    }

    /// Slot index of the request most recently returned from `listen`.
    pub fn slot(&self) -> usize {
        self.inner.lock().current_slot
    }

    pub fn accept(&self, slot: usize, session_id: u64) {
        self.inner.lock().slots[slot].state = SlotState::Decided(session_id);
        self.client_cv.notify_all();
    }

    pub fn reject(&self, slot: usize) {
        self.inner.lock().slots[slot].state = SlotState::Decided(CONNECTION_REJECTED);
        self.client_cv.notify_all();
    }

    /// Blocks until the listener decides on the ticket's request; returns
    /// the assigned session id, or `CONNECTION_REJECTED` on reject or
    /// terminate.
    pub fn wait(&self, ticket: u64) -> u64 {
        let mut inner = self.inner.lock();
        loop {
            let Some(slot) = inner
                .slots
                .iter()
                .position(|entry| entry.ticket == ticket && entry.state != SlotState::Free)
            else {
                return CONNECTION_REJECTED;
            };
            if let SlotState::Decided(session_id) = inner.slots[slot].state {
                if session_id == CONNECTION_REJECTED {
                    inner.slots[slot].state = SlotState::Free;
                } else {
                    inner.slots[slot].state = SlotState::Active;
                }
                return session_id;
            }
            if inner.terminated {
                inner.slots[slot].state = SlotState::Free;
                return CONNECTION_REJECTED;
            }
            self.client_cv.wait(&mut inner);
        }
    }

    /// Frees the budget slot of a finished session.
    pub fn release_slot(&self, slot: usize) {
        let mut inner = self.inner.lock();
        inner.slots[slot] = SlotEntry {
            state: SlotState::Free,
            ticket: 0,
        };
    }

    /// One-shot terminate signal: unblocks the listener and any waiting
    /// clients.
    pub fn request_terminate(&self) {
        self.inner.lock().terminated = true;
        self.listener_cv.notify_all();
        self.client_cv.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock().terminated
    }

    /// Listener acknowledgement that it stopped accepting.
    pub fn confirm_terminated(&self) {
        self.inner.lock().terminate_confirmed = true;
        self.client_cv.notify_all();
    }

    pub fn is_terminate_confirmed(&self) -> bool {
        self.inner.lock().terminate_confirmed
    }
}

/// Process-wide connection channel of the IPC endpoint: the connection
/// queue plus the wires of accepted sessions, addressable by session id.
pub struct ConnectionContainer {
    database_name: String,
    queue: ConnectionQueue,
    wires: Mutex<HashMap<u64, Arc<ServerWire>>>,
}

impl ConnectionContainer {
    pub fn new(database_name: impl Into<String>, threads: usize, admin_sessions: usize) -> Self {
        Self {
            database_name: database_name.into(),
            queue: ConnectionQueue::new(threads, admin_sessions),
            wires: Mutex::new(HashMap::new()),
        }
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn connection_queue(&self) -> &ConnectionQueue {
        &self.queue
    }

    pub fn find_wire(&self, session_id: u64) -> Option<Arc<ServerWire>> {
        self.wires.lock().get(&session_id).cloned()
    }

    fn register_wire(&self, session_id: u64, wire: Arc<ServerWire>) {
        self.wires.lock().insert(session_id, wire);
    }

    fn remove_wire(&self, session_id: u64) {
        self.wires.lock().remove(&session_id);
    }

    fn close_all_wires(&self) {
        for wire in self.wires.lock().values() {
            wire.close_session();
        }
    }
}

/// Response bound to one slot of a session wire.
pub(crate) struct IpcResponse {
    wire: Arc<ServerWire>,
    slot: u16,
    session_id: AtomicU64,
    write_state: ResponseWriteState,
    cancelled: AtomicBool,
    channels: Mutex<HashMap<String, Arc<IpcDataChannel>>>,
}

impl IpcResponse {
    pub(crate) fn new(wire: Arc<ServerWire>, slot: u16) -> Self {
        Self {
            wire,
            slot,
            session_id: AtomicU64::new(crate::service::SESSION_ID_UNKNOWN),
            write_state: ResponseWriteState::default(),
            cancelled: AtomicBool::new(false),
            channels: Mutex::new(HashMap::new()),
        }
    }
}

impl Response for IpcResponse {
    fn set_session_id(&self, id: u64) {
        self.session_id.store(id, Ordering::Release);
    }

    fn set_code(&self, _code: ResponseCode) {}

    fn body_head(&self, data: &[u8]) -> Result<(), ForecourtError> {
        self.write_state.claim_body_head()?;
        self.wire.send_response(ResponseMessage {
            slot: self.slot,
            kind: ResponseKind::BodyHead,
            channel: None,
            payload: data.to_vec(),
        });
        Ok(())
    }

    fn body(&self, data: &[u8]) -> Result<(), ForecourtError> {
        self.write_state.claim_body()?;
        self.wire.send_response(ResponseMessage {
            slot: self.slot,
            kind: ResponseKind::Body,
            channel: None,
            payload: data.to_vec(),
        });
        Ok(())
    }

    fn error(&self, record: Diagnostics) {
        self.write_state.mark_error();
        self.wire.send_response(ResponseMessage {
            slot: self.slot,
            kind: ResponseKind::Diagnostic,
            channel: None,
            payload: serde_json::to_vec(&record).unwrap_or_default(),
        });
    }

    fn acquire_channel(&self, name: &str) -> Result<Arc<dyn DataChannel>, ForecourtError> {
        let mut channels = self.channels.lock();
        if channels.contains_key(name) {
            return Err(ForecourtError::ServiceError(format!(
                "channel '{name}' already acquired"
            )));
        }
        let channel = Arc::new(IpcDataChannel {
            name: name.to_string(),
            wire: Arc::clone(&self.wire),
            slot: self.slot,
            writers: Mutex::new(Vec::new()),
        });
        self.wire.gc().register();
        channels.insert(name.to_string(), Arc::clone(&channel));
        Ok(channel)
    }

    fn release_channel(&self, channel: Arc<dyn DataChannel>) -> Result<(), ForecourtError> {
        let removed = self.channels.lock().remove(channel.name());
        let Some(concrete) = removed else {
            return Err(ForecourtError::ServiceError(format!(
                "channel '{}' is not acquired",
                channel.name()
            )));
        };
        concrete.release_remaining_writers();
        self.wire.gc().collect();
        Ok(())
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

/// Result-set channel of an IPC response: committed writer data is flushed
/// onto the response wire when the writer is released.
pub(crate) struct IpcDataChannel {
    name: String,
    wire: Arc<ServerWire>,
    slot: u16,
    writers: Mutex<Vec<Arc<IpcDataWriter>>>,
}

impl IpcDataChannel {
    fn flush_writer(&self, writer: &IpcDataWriter) {
        for chunk in writer.take_committed() {
            self.wire.send_response(ResponseMessage {
                slot: self.slot,
                kind: ResponseKind::ChannelData,
                channel: Some(self.name.clone()),
                payload: chunk,
            });
        }
    }

    fn release_remaining_writers(&self) {
        for writer in self.writers.lock().drain(..) {
            self.flush_writer(&writer);
        }
    }
}

impl DataChannel for IpcDataChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn acquire_writer(&self) -> Result<Arc<dyn DataWriter>, ForecourtError> {
        let writer = Arc::new(IpcDataWriter::default());
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
        let held = writers.remove(position);
        drop(writers);
        self.flush_writer(&held);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct IpcDataWriter {
    buffer: Mutex<Vec<u8>>,
    committed: Mutex<Vec<Vec<u8>>>,
}

impl IpcDataWriter {
    fn take_committed(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.committed.lock())
    }
}

impl DataWriter for IpcDataWriter {
    fn write(&self, data: &[u8]) -> Result<(), ForecourtError> {
        self.buffer.lock().extend_from_slice(data);
        Ok(())
    }

    fn commit(&self) -> Result<(), ForecourtError> {
        let chunk = std::mem::take(&mut *self.buffer.lock());
        if !chunk.is_empty() {
            self.committed.lock().push(chunk);
        }
        Ok(())
    }
}

/// Session worker of one accepted IPC connection.
struct IpcWorker {
    common: WorkerCommon,
    routing: Arc<RoutingService>,
    wire: Arc<ServerWire>,
}

impl IpcWorker {
    fn new(
        routing: Arc<RoutingService>,
        session_id: u64,
        wire: Arc<ServerWire>,
        database_info: Arc<DatabaseInfo>,
        sessions: Arc<SessionsCore>,
    ) -> Self {
        let connection_info = wire.name().to_string();
        Self {
            common: WorkerCommon::new(
                ConnectionType::Ipc,
                session_id,
                connection_info,
                database_info,
                sessions,
            ),
            routing,
            wire,
        }
    }

    fn run(&self) {
        if self.do_handshake() {
            self.do_work();
        }
        if self.has_incomplete_resultset() {
            warn!(
                session_id = self.common.session_id(),
                "session closed with unreleased result-set channels"
            );
        }
        self.common.dispose_session_store();
        debug!(session_id = self.common.session_id(), "ipc session finished");
    }

    fn do_handshake(&self) -> bool {
        let Some((header, payload)) = self.wire.peep(true) else {
            return false;
        };
        if header.is_session_close() {
            return false;
        }
        let (_, body) = match decode_request_payload(&payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(session_id = self.common.session_id(), error = %err, "handshake framing error");
                return false;
            }
        };
        let request = self.common.make_request(SERVICE_ID_ROUTING, body.to_vec());
        let response = IpcResponse::new(Arc::clone(&self.wire), header.slot);
        self.common.handshake(&*request, &response)
    }

    fn do_work(&self) {
        loop {
            let Some((header, payload)) = self.wire.peep(true) else {
                break;
            };
            if header.is_session_close() {
                break;
            }
            let (service_id, body) = match decode_request_payload(&payload) {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!(
                        session_id = self.common.session_id(),
                        error = %err,
                        "dropping unreadable request frame"
                    );
                    continue;
                }
            };
            let request = self.common.make_request(service_id, body.to_vec());
            let response: Arc<dyn Response> =
                Arc::new(IpcResponse::new(Arc::clone(&self.wire), header.slot));
            if service_id != SERVICE_ID_ROUTING
                && self.common.check_shutdown_request() != ShutdownRequest::None
            {
                self.common.notify_client(
                    &*response,
                    DiagnosticCode::SessionClosed,
                    "this session is already shutdown",
                );
                continue;
            }
            self.common.register_reqres(
                header.slot,
                Arc::clone(&request) as Arc<dyn Request>,
                Arc::clone(&response),
            );
            let keep_going = self.routing.call(request, response);
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
                break;
            }
            if self.wire.is_session_closed() {
                break;
            }
        }
    }

    fn has_incomplete_resultset(&self) -> bool {
        !self.wire.gc().all_collected()
    }
}

/// IPC endpoint component: owns the connection container and the listener
/// thread.
pub struct IpcEndpoint {
    container: Arc<ConnectionContainer>,
    routing: Arc<RoutingService>,
    sessions: Arc<SessionsCore>,
    database_info: Arc<DatabaseInfo>,
    listener: Mutex<Option<JoinHandle<()>>>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl IpcEndpoint {
    pub fn new(
        config: &crate::config::IpcEndpointConfig,
        routing: Arc<RoutingService>,
        sessions: Arc<SessionsCore>,
        database_info: Arc<DatabaseInfo>,
    ) -> Self {
        Self {
            container: Arc::new(ConnectionContainer::new(
                config.database_name.clone(),
                config.threads,
                config.admin_sessions,
            )),
            routing,
            sessions,
            database_info,
            listener: Mutex::new(None),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn container(&self) -> Arc<ConnectionContainer> {
        Arc::clone(&self.container)
    }
}

impl Endpoint for IpcEndpoint {
    fn label(&self) -> &str {
        "ipc_endpoint"
    }

    fn start(&self) -> Result<(), ForecourtError> {
        let container = Arc::clone(&self.container);
        let routing = Arc::clone(&self.routing);
        let sessions = Arc::clone(&self.sessions);
        let database_info = Arc::clone(&self.database_info);
        let workers = Arc::clone(&self.workers);
        let handle = std::thread::Builder::new()
            .name("forecourt-ipc-listener".to_string())
            .spawn(move || listener_loop(container, routing, sessions, database_info, workers))?;
        *self.listener.lock() = Some(handle);
        info!(
            database = self.container.database_name(),
            "ipc endpoint started"
        );
        Ok(())
    }

    fn shutdown(&self) -> Result<(), ForecourtError> {
        self.container.connection_queue().request_terminate();
        if let Some(handle) = self.listener.lock().take() {
            let _ = handle.join();
        }
        self.container.close_all_wires();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        info!("ipc endpoint stopped");
        Ok(())
    }
}

fn listener_loop(
    container: Arc<ConnectionContainer>,
    routing: Arc<RoutingService>,
    sessions: Arc<SessionsCore>,
    database_info: Arc<DatabaseInfo>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    let queue = container.connection_queue();
    loop {
        let session_id = queue.listen();
        if queue.is_terminated() {
            debug!("ipc listener received terminate request");
            queue.confirm_terminated();
            break;
        }
        let slot = queue.slot();
        let wire = Arc::new(ServerWire::new(format!(
            "{}-{}",
            container.database_name(),
            session_id
        )));
        container.register_wire(session_id, Arc::clone(&wire));
        queue.accept(slot, session_id);
        debug!(session_id, wire = wire.name(), "accepted ipc connection");

        let worker_container = Arc::clone(&container);
        let worker = IpcWorker::new(
            Arc::clone(&routing),
            session_id,
            wire,
            Arc::clone(&database_info),
            Arc::clone(&sessions),
        );
        let handle = std::thread::Builder::new()
            .name(format!("forecourt-ipc-session-{session_id}"))
            .spawn(move || {
                worker.run();
                worker_container.remove_wire(session_id);
                worker_container.connection_queue().release_slot(slot);
            });
        match handle {
            Ok(handle) => {
                let mut workers = workers.lock();
                workers.retain(|held| !held.is_finished());
                workers.push(handle);
            }
            Err(err) => {
                warn!(session_id, error = %err, "failed to spawn ipc session worker");
                container.remove_wire(session_id);
                queue.release_slot(slot);
            }
        }
    }
}

/// Client half of an IPC session, for tests and in-process tooling.
pub struct IpcClient {
    session_id: u64,
    wire: Arc<ServerWire>,
}

impl std::fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcClient")
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl IpcClient {
    pub fn connect(container: &ConnectionContainer) -> Result<Self, ForecourtError> {
        let ticket = container.connection_queue().request()?;
        Self::finish_connect(container, ticket)
    }

    pub fn connect_admin(container: &ConnectionContainer) -> Result<Self, ForecourtError> {
        let ticket = container.connection_queue().request_admin()?;
        Self::finish_connect(container, ticket)
    }

    fn finish_connect(container: &ConnectionContainer, ticket: u64) -> Result<Self, ForecourtError> {
        let session_id = container.connection_queue().wait(ticket);
        if session_id == CONNECTION_REJECTED {
            return Err(ForecourtError::ResourceLimitReached(
                "connection rejected".into(),
            ));
        }
        let wire = container
            .find_wire(session_id)
            .ok_or(ForecourtError::TransportClosed)?;
        Ok(Self { session_id, wire })
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn handshake(&self, message: &HandshakeRequest) -> Result<u64, ForecourtError> {
        let body = serde_json::to_vec(message)
            .map_err(|err| ForecourtError::HandshakeFailed(err.to_string()))?;
        self.wire.send_request(0, SERVICE_ID_ROUTING, &body);
        let reply = self
            .wire
            .receive_response(true)
            .ok_or(ForecourtError::TransportClosed)?;
        match reply.kind {
            ResponseKind::Body => {
                let decoded: HandshakeResponse = serde_json::from_slice(&reply.payload)
                    .map_err(|err| ForecourtError::HandshakeFailed(err.to_string()))?;
                Ok(decoded.session_id)
            }
            ResponseKind::Diagnostic => Err(ForecourtError::HandshakeFailed(
                String::from_utf8_lossy(&reply.payload).into_owned(),
            )),
            _ => Err(ForecourtError::TransportFraming(
                "unexpected handshake reply kind".into(),
            )),
        }
    }

    pub fn send(&self, slot: u16, service_id: u32, body: &[u8]) {
        self.wire.send_request(slot, service_id, body);
    }

    pub fn recv(&self) -> Result<ResponseMessage, ForecourtError> {
        self.wire
            .receive_response(true)
            .ok_or(ForecourtError::TransportClosed)
    }

    pub fn close(&self) {
        self.wire.close_session();
    }
}
