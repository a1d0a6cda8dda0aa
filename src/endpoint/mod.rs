//! Endpoint dispatch runtime. The IPC and stream endpoints (and the
//! loopback endpoint used by tests and tools) share the session-worker base
//! in this module: in-flight request/response tracking, the session-level
//! shutdown state machine, and the handshake that establishes session_info.

pub mod ipc;
pub mod loopback;
pub mod stream;

use crate::error::ForecourtError;
use crate::service::{DatabaseInfo, DiagnosticCode, Diagnostics, Request, Response};
use crate::session::{
    ConnectionType, SessionContext, SessionInfo, SessionStore, SessionVariableSet, SessionsCore,
    ShutdownRequest,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, trace, warn};

/// Lifecycle contract of a server endpoint: `setup → start → shutdown`,
/// driven by the server assembly in registration order (shutdown reversed).
pub trait Endpoint: Send + Sync {
    fn label(&self) -> &str;
    fn setup(&self) -> Result<(), ForecourtError> {
        Ok(())
    }
    fn start(&self) -> Result<(), ForecourtError>;
    fn shutdown(&self) -> Result<(), ForecourtError>;
}

/// First message exchanged on a fresh session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub label: String,
    pub application: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub session_id: u64,
}

/// Framed payloads lead with the target service id.
pub fn encode_request_payload(service_id: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&service_id.to_be_bytes());
    out.extend_from_slice(body);
    out
}

pub fn decode_request_payload(bytes: &[u8]) -> Result<(u32, &[u8]), ForecourtError> {
    if bytes.len() < 4 {
        return Err(ForecourtError::TransportFraming(
            "request payload shorter than its service id header".into(),
        ));
    }
    let service_id = u32::from_be_bytes(
        bytes[0..4]
            .try_into()
            .map_err(|_| ForecourtError::TransportFraming("unreadable service id".into()))?,
    );
    Ok((service_id, &bytes[4..]))
}

/// Request object shared by every endpoint flavour: a framed inbound
/// message bound to its session's identity.
pub(crate) struct EndpointRequest {
    session_id: u64,
    service_id: u32,
    payload: Vec<u8>,
    database_info: Arc<DatabaseInfo>,
    session_info: SessionInfo,
    session_store: Arc<SessionStore>,
}

impl EndpointRequest {
    pub(crate) fn new(
        session_id: u64,
        service_id: u32,
        payload: Vec<u8>,
        database_info: Arc<DatabaseInfo>,
        session_info: SessionInfo,
        session_store: Arc<SessionStore>,
    ) -> Self {
        Self {
            session_id,
            service_id,
            payload,
            database_info,
            session_info,
            session_store,
        }
    }
}

impl Request for EndpointRequest {
    fn session_id(&self) -> u64 {
        self.session_id
    }

    fn service_id(&self) -> u32 {
        self.service_id
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn database_info(&self) -> &DatabaseInfo {
        &self.database_info
    }

    fn session_info(&self) -> &SessionInfo {
        &self.session_info
    }

    fn session_store(&self) -> &SessionStore {
        &self.session_store
    }
}

struct ReqResEntry {
    response: Arc<dyn Response>,
    registered_at: Instant,
}

/// In-flight pairs older than this are surfaced by `care_reqreses`.
const REQRES_WARN_AGE: Duration = Duration::from_secs(60);

/// Session-worker base shared by the IPC and stream endpoints.
pub(crate) struct WorkerCommon {
    session_id: u64,
    connection_type: ConnectionType,
    connection_info: String,
    database_info: Arc<DatabaseInfo>,
    sessions: Arc<SessionsCore>,
    session_store: Arc<SessionStore>,
    context: Mutex<Option<Arc<SessionContext>>>,
    session_info: Mutex<SessionInfo>,
    reqres: Mutex<HashMap<u16, ReqResEntry>>,
    shutdown_completed: AtomicBool,
    shutdown_from_client: AtomicBool,
}

impl WorkerCommon {
    pub(crate) fn new(
        connection_type: ConnectionType,
        session_id: u64,
        connection_info: impl Into<String>,
        database_info: Arc<DatabaseInfo>,
        sessions: Arc<SessionsCore>,
    ) -> Self {
        let connection_info = connection_info.into();
        let session_info = SessionInfo::new(session_id, connection_type, connection_info.clone());
        Self {
            session_id,
            connection_type,
            connection_info,
            database_info,
            sessions,
            session_store: Arc::new(SessionStore::new()),
            context: Mutex::new(None),
            session_info: Mutex::new(session_info),
            reqres: Mutex::new(HashMap::new()),
            shutdown_completed: AtomicBool::new(false),
            shutdown_from_client: AtomicBool::new(false),
        }
    }

    pub(crate) fn session_id(&self) -> u64 {
        self.session_id
    }

    pub(crate) fn database_info(&self) -> Arc<DatabaseInfo> {
        Arc::clone(&self.database_info)
    }

    pub(crate) fn session_store(&self) -> Arc<SessionStore> {
        Arc::clone(&self.session_store)
    }

    pub(crate) fn session_info(&self) -> SessionInfo {
        self.session_info.lock().clone()
    }

    pub(crate) fn make_request(&self, service_id: u32, body: Vec<u8>) -> Arc<EndpointRequest> {
        Arc::new(EndpointRequest::new(
            self.session_id,
            service_id,
            body,
            self.database_info(),
            self.session_info(),
            self.session_store(),
        ))
    }

    /// Performs the initial protocol exchange: decodes the handshake
    /// message, fixes session_info, and registers the session context.
    /// Returning false means the caller must close the transport without
    /// serving any request.
    pub(crate) fn handshake(
        &self,
        request: &dyn Request,
        response: &dyn Response,
    ) -> bool {
        response.set_session_id(self.session_id);
        let message = match serde_json::from_slice::<HandshakeRequest>(request.payload()) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    session_id = self.session_id,
                    error = %err,
                    "handshake message unreadable"
                );
                self.notify_client(
                    response,
                    DiagnosticCode::HandshakeFailed,
                    format!("handshake failed: {err}"),
                );
                return false;
            }
        };
        let mut session_info =
            SessionInfo::new(self.session_id, self.connection_type, self.connection_info.clone());
        session_info.label = message.label;
        session_info.application = message.application;
        session_info.user = message.user;
        let context = Arc::new(SessionContext::new(
            session_info.clone(),
            SessionVariableSet::empty(),
        ));
        if !self.sessions.register_session(&context) {
            warn!(session_id = self.session_id, "session id collision at handshake");
            self.notify_client(
                response,
                DiagnosticCode::HandshakeFailed,
                "session id already in use",
            );
            return false;
        }
        *self.session_info.lock() = session_info;
        *self.context.lock() = Some(context);
        let reply = HandshakeResponse {
            session_id: self.session_id,
        };
        let body = serde_json::to_vec(&reply).unwrap_or_default();
        if response.body(&body).is_err() {
            return false;
        }
        info!(
            session_id = self.session_id,
            connection = %self.connection_type,
            "session started"
        );
        true
    }

    /// Tracks an in-flight request/response pair keyed by its transport
    /// slot, for cancellation and diagnostics during shutdown.
    pub(crate) fn register_reqres(
        &self,
        slot: u16,
        _request: Arc<dyn Request>,
        response: Arc<dyn Response>,
    ) {
        self.reqres.lock().insert(
            slot,
            ReqResEntry {
                response,
                registered_at: Instant::now(),
            },
        );
    }

    pub(crate) fn remove_reqres(&self, slot: u16) {
        self.reqres.lock().remove(&slot);
    }

    /// Sweeps the in-flight map: prunes completed pairs and surfaces any
    /// that have been outstanding suspiciously long.
    pub(crate) fn care_reqreses(&self) {
        let mut reqres = self.reqres.lock();
        reqres.retain(|slot, entry| {
            if entry.response.is_completed() {
                return false;
            }
            if entry.registered_at.elapsed() > REQRES_WARN_AGE {
                warn!(
                    session_id = self.session_id,
                    slot, "request/response pair outstanding for over a minute"
                );
            }
            true
        });
    }

    /// True when no in-flight request/response pair remains.
    pub(crate) fn is_completed(&self) -> bool {
        self.reqres.lock().is_empty()
    }

    pub(crate) fn find_response(&self, slot: u16) -> Option<Arc<dyn Response>> {
        self.reqres
            .lock()
            .get(&slot)
            .map(|entry| Arc::clone(&entry.response))
    }

    pub(crate) fn check_shutdown_request(&self) -> ShutdownRequest {
        self.context
            .lock()
            .as_ref()
            .map(|ctx| ctx.shutdown_request())
            .unwrap_or(ShutdownRequest::None)
    }

    /// Flags this session for shutdown. A forceful request additionally
    /// cancels every in-flight response.
    pub(crate) fn request_shutdown(&self, request: ShutdownRequest) -> bool {
        let recorded = self
            .context
            .lock()
            .as_ref()
            .map(|ctx| ctx.request_shutdown(request))
            .unwrap_or(false);
        if recorded && request == ShutdownRequest::Forceful {
            for entry in self.reqres.lock().values() {
                entry.response.cancel();
            }
        }
        recorded
    }

    /// Records that the pending shutdown finished draining. Effective at
    /// most once per session.
    pub(crate) fn shutdown_complete(&self) {
        if !self.shutdown_completed.swap(true, Ordering::AcqRel) {
            info!(session_id = self.session_id, "session shutdown complete");
        }
    }

    pub(crate) fn mark_shutdown_from_client(&self) {
        self.shutdown_from_client.store(true, Ordering::Release);
    }

    pub(crate) fn shutdown_from_client(&self) -> bool {
        self.shutdown_from_client.load(Ordering::Acquire)
    }

    pub(crate) fn notify_client(
        &self,
        response: &dyn Response,
        code: DiagnosticCode,
        message: impl Into<String>,
    ) {
        response.set_session_id(self.session_id);
        response.error(Diagnostics::new(code, message));
    }

    /// Terminal cleanup: drops per-session service data and takes the
    /// session out of the registry.
    pub(crate) fn dispose_session_store(&self) {
        self.session_store.dispose();
        if self.context.lock().take().is_some() {
            self.sessions.unregister_session(self.session_id);
        }
        trace!(session_id = self.session_id, "session disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::{WorkerCommon, decode_request_payload, encode_request_payload};
    use crate::service::DatabaseInfo;
    use crate::session::{ConnectionType, SessionsCore, ShutdownRequest};
    use std::sync::Arc;

    fn worker_common(session_id: u64) -> (WorkerCommon, Arc<SessionsCore>) {
        let sessions = Arc::new(SessionsCore::new());
        let common = WorkerCommon::new(
            ConnectionType::Stream,
            session_id,
            "127.0.0.1:0",
            Arc::new(DatabaseInfo::new("testdb")),
            Arc::clone(&sessions),
        );
        (common, sessions)
    }

    #[test]
    fn payload_header_round_trip() {
        let encoded = encode_request_payload(9, b"hello");
        let (service_id, body) = decode_request_payload(&encoded).expect("decode");
        assert_eq!(service_id, 9);
        assert_eq!(body, b"hello");
        assert!(decode_request_payload(&[1, 2]).is_err());
    }

    #[test]
    fn shutdown_state_machine_without_context() {
        let (common, _sessions) = worker_common(1);
        assert_eq!(common.check_shutdown_request(), ShutdownRequest::None);
        assert!(!common.request_shutdown(ShutdownRequest::Forceful));
        assert!(!common.shutdown_from_client());
        common.mark_shutdown_from_client();
        assert!(common.shutdown_from_client());
    }

    #[test]
    fn dispose_unregisters_only_registered_sessions() {
        let (common, sessions) = worker_common(2);
        // no handshake happened, nothing to unregister
        common.dispose_session_store();
        assert!(sessions.session_list().is_empty());
    }
}
