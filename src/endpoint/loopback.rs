//! Loopback endpoint: an in-process endpoint with no transport, used by
//! tests and developer tools. Responses buffer everything a service writes
//! so callers can assert on body, body_head, and per-channel committed
//! data after `request` returns.

use crate::endpoint::{Endpoint, EndpointRequest};
use crate::error::ForecourtError;
use crate::service::{
    DataChannel, DataWriter, DatabaseInfo, Diagnostics, Response, ResponseCode,
    ResponseWriteState, RoutingService, Service,
};
use crate::session::{ConnectionType, SessionInfo, SessionStore};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// In-process endpoint bound directly to the routing service.
pub struct LoopbackEndpoint {
    routing: Arc<RoutingService>,
    database_info: Arc<DatabaseInfo>,
}

impl LoopbackEndpoint {
    pub fn new(routing: Arc<RoutingService>, database_info: Arc<DatabaseInfo>) -> Self {
        Self {
            routing,
            database_info,
        }
    }

    /// Sends one request through the routing service and returns the
    /// buffered response.
    pub fn request(
        &self,
        session_id: u64,
        service_id: u32,
        payload: &[u8],
    ) -> Result<LoopbackResponse, ForecourtError> {
        let session_info = SessionInfo::new(session_id, ConnectionType::Loopback, "loopback");
        let request = Arc::new(EndpointRequest::new(
            session_id,
            service_id,
            payload.to_vec(),
            Arc::clone(&self.database_info),
            session_info,
            Arc::new(SessionStore::new()),
        ));
        let inner = Arc::new(LoopbackResponseInner::new());
        let response: Arc<dyn Response> = Arc::clone(&inner) as Arc<dyn Response>;
        debug!(session_id, service_id, "loopback request");
        self.routing.call(request, response);
        Ok(LoopbackResponse { inner })
    }
}

impl Endpoint for LoopbackEndpoint {
    fn label(&self) -> &str {
        "loopback_endpoint"
    }

    fn start(&self) -> Result<(), ForecourtError> {
        Ok(())
    }

    fn shutdown(&self) -> Result<(), ForecourtError> {
        Ok(())
    }
}

/// Read-only view over a finished loopback exchange.
pub struct LoopbackResponse {
    inner: Arc<LoopbackResponseInner>,
}

impl LoopbackResponse {
    pub fn session_id(&self) -> u64 {
        self.inner.session_id.load(Ordering::Acquire)
    }

    pub fn code(&self) -> ResponseCode {
        *self.inner.code.lock()
    }

    pub fn body_head(&self) -> Vec<u8> {
        self.inner.body_head.lock().clone()
    }

    pub fn body(&self) -> Vec<u8> {
        self.inner.body.lock().clone()
    }

    pub fn diagnostics(&self) -> Option<Diagnostics> {
        self.inner.diagnostics.lock().clone()
    }

    /// Committed data of one released channel, in commit order.
    pub fn channel(&self, name: &str) -> Vec<Vec<u8>> {
        self.inner
            .channels
            .read()
            .released
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Committed data of every released channel.
    pub fn all_committed_data(&self) -> HashMap<String, Vec<Vec<u8>>> {
        self.inner.channels.read().released.clone()
    }
}

#[derive(Default)]
struct ChannelMaps {
    /// Channels handed out and not yet released.
    acquired: HashMap<String, Arc<LoopbackDataChannel>>,
    /// Data of released channels; a re-acquired name appends to the same
    /// vector.
    released: HashMap<String, Vec<Vec<u8>>>,
}

struct LoopbackResponseInner {
    session_id: AtomicU64,
    code: Mutex<ResponseCode>,
    body_head: Mutex<Vec<u8>>,
    body: Mutex<Vec<u8>>,
    diagnostics: Mutex<Option<Diagnostics>>,
    write_state: ResponseWriteState,
    cancelled: AtomicBool,
    // one lock for both maps so a release (remove from acquired, append to
    // released) is atomic
    channels: RwLock<ChannelMaps>,
}

impl LoopbackResponseInner {
    fn new() -> Self {
        Self {
            session_id: AtomicU64::new(crate::service::SESSION_ID_UNKNOWN),
            code: Mutex::new(ResponseCode::Unknown),
            body_head: Mutex::new(Vec::new()),
            body: Mutex::new(Vec::new()),
            diagnostics: Mutex::new(None),
            write_state: ResponseWriteState::default(),
            cancelled: AtomicBool::new(false),
            channels: RwLock::new(ChannelMaps::default()),
        }
    }
}

impl Response for LoopbackResponseInner {
    fn set_session_id(&self, id: u64) {
        self.session_id.store(id, Ordering::Release);
    }

    fn set_code(&self, code: ResponseCode) {
        *self.code.lock() = code;
    }

    fn body_head(&self, data: &[u8]) -> Result<(), ForecourtError> {
        self.write_state.claim_body_head()?;
        *self.body_head.lock() = data.to_vec();
        Ok(())
    }

    fn body(&self, data: &[u8]) -> Result<(), ForecourtError> {
        self.write_state.claim_body()?;
        *self.body.lock() = data.to_vec();
        Ok(())
    }

    fn error(&self, record: Diagnostics) {
        self.write_state.mark_error();
        *self.diagnostics.lock() = Some(record);
    }

    fn acquire_channel(&self, name: &str) -> Result<Arc<dyn DataChannel>, ForecourtError> {
        let mut channels = self.channels.write();
        if channels.acquired.contains_key(name) {
            return Err(ForecourtError::ServiceError(format!(
                "channel '{name}' already acquired"
            )));
        }
        let channel = Arc::new(LoopbackDataChannel::new(name));
        channels.acquired.insert(name.to_string(), Arc::clone(&channel));
        Ok(channel)
    }

    fn release_channel(&self, channel: Arc<dyn DataChannel>) -> Result<(), ForecourtError> {
        let mut channels = self.channels.write();
        let Some(concrete) = channels.acquired.remove(channel.name()) else {
            return Err(ForecourtError::ServiceError(format!(
                "channel '{}' is not acquired",
                channel.name()
            )));
        };
        // releasing the channel releases its still-acquired writers too
        concrete.release_remaining_writers();
        channels
            .released
            .entry(concrete.name.clone())
            .or_default()
            .append(&mut concrete.take_committed());
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

/// Loopback result-set channel: writer data lands in the channel's
/// committed vector at writer release, in release order.
struct LoopbackDataChannel {
    name: String,
    writers: Mutex<Vec<Arc<LoopbackDataWriter>>>,
    committed: Mutex<Vec<Vec<u8>>>,
}

impl LoopbackDataChannel {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            writers: Mutex::new(Vec::new()),
            committed: Mutex::new(Vec::new()),
        }
    }

    fn absorb_writer(&self, writer: &LoopbackDataWriter) {
        self.committed.lock().append(&mut writer.take_committed());
    }

    fn release_remaining_writers(&self) {
        for writer in self.writers.lock().drain(..) {
            self.absorb_writer(&writer);
        }
    }

    fn take_committed(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.committed.lock())
    }
}

impl DataChannel for LoopbackDataChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn acquire_writer(&self) -> Result<Arc<dyn DataWriter>, ForecourtError> {
        let writer = Arc::new(LoopbackDataWriter::default());
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
        self.absorb_writer(&held);
        Ok(())
    }
}

#[derive(Default)]
struct LoopbackDataWriter {
    buffer: Mutex<Vec<u8>>,
    committed: Mutex<Vec<Vec<u8>>>,
}

impl LoopbackDataWriter {
    fn take_committed(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.committed.lock())
    }
}

impl DataWriter for LoopbackDataWriter {
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
