//! Capability contracts for request dispatch: what a request and a response
//! expose, how data channels hand out writers, and the routing registry
//! that maps a `service_id` to its service.

use crate::error::ForecourtError;
use crate::session::{SessionInfo, SessionStore};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::warn;

/// Service id of the routing layer itself.
pub const SERVICE_ID_ROUTING: u32 = 0;
/// Service id handled inside the endpoint worker (currently: cancel).
pub const SERVICE_ID_ENDPOINT_BROKER: u32 = 1;
/// Service id of the session control bridge.
pub const SERVICE_ID_SESSION: u32 = 2;

/// Session id a response carries before the request's id is assigned.
pub const SESSION_ID_UNKNOWN: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseCode {
    #[default]
    Unknown,
    Success,
    ApplicationError,
    IoError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCode {
    SessionClosed,
    ServiceNotFound,
    ResourceLimitReached,
    HandshakeFailed,
    OperationDenied,
    IllegalState,
    Io,
    Unknown,
}

/// Diagnostics record sent to the client in place of a success body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub code: DiagnosticCode,
    pub message: String,
}

impl Diagnostics {
    pub fn new(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Static description of the served database, shared by every request.
#[derive(Debug, Clone)]
pub struct DatabaseInfo {
    pub name: String,
    pub process_id: u32,
    pub start_at: SystemTime,
}

impl DatabaseInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            process_id: std::process::id(),
            start_at: SystemTime::now(),
        }
    }
}

/// What a framed inbound message exposes to a service.
pub trait Request: Send + Sync {
    fn session_id(&self) -> u64;
    fn service_id(&self) -> u32;
    fn payload(&self) -> &[u8];
    fn database_info(&self) -> &DatabaseInfo;
    fn session_info(&self) -> &SessionInfo;
    fn session_store(&self) -> &SessionStore;
}

/// What a service may write back. `body_head` at most once and before
/// `body`; `body` at most once; `error` excludes both.
pub trait Response: Send + Sync {
    fn set_session_id(&self, id: u64);
    fn set_code(&self, code: ResponseCode);
    fn body_head(&self, data: &[u8]) -> Result<(), ForecourtError>;
    fn body(&self, data: &[u8]) -> Result<(), ForecourtError>;
    fn error(&self, record: Diagnostics);
    fn acquire_channel(&self, name: &str) -> Result<Arc<dyn DataChannel>, ForecourtError>;
    fn release_channel(&self, channel: Arc<dyn DataChannel>) -> Result<(), ForecourtError>;
    /// Whether a terminal output (body or error) has been produced.
    fn is_completed(&self) -> bool;
    /// Cooperative cancellation: services observe the flag at checkpoints.
    fn cancel(&self);
    fn is_cancelled(&self) -> bool;
}

/// Named output channel of a response; writers are acquired and released
/// independently.
pub trait DataChannel: Send + Sync {
    fn name(&self) -> &str;
    fn acquire_writer(&self) -> Result<Arc<dyn DataWriter>, ForecourtError>;
    fn release_writer(&self, writer: Arc<dyn DataWriter>) -> Result<(), ForecourtError>;
}

pub trait DataWriter: Send + Sync {
    fn write(&self, data: &[u8]) -> Result<(), ForecourtError>;
    fn commit(&self) -> Result<(), ForecourtError>;
}

/// Write-protocol state shared by the response implementations: tracks the
/// body_head/body/error exclusion rules so every endpoint enforces them the
/// same way.
#[derive(Debug, Default)]
pub(crate) struct ResponseWriteState {
    inner: Mutex<WriteFlags>,
}

#[derive(Debug, Default, Clone, Copy)]
struct WriteFlags {
    head_written: bool,
    body_written: bool,
    errored: bool,
}

impl ResponseWriteState {
    pub(crate) fn claim_body_head(&self) -> Result<(), ForecourtError> {
        let mut flags = self.inner.lock();
        if flags.errored {
            return Err(ForecourtError::ServiceError(
                "body_head after error".into(),
            ));
        }
        if flags.body_written {
            return Err(ForecourtError::ServiceError("body_head after body".into()));
        }
        if flags.head_written {
            return Err(ForecourtError::ServiceError(
                "body_head written twice".into(),
            ));
        }
        flags.head_written = true;
        Ok(())
    }

    pub(crate) fn claim_body(&self) -> Result<(), ForecourtError> {
        let mut flags = self.inner.lock();
        if flags.errored {
            return Err(ForecourtError::ServiceError("body after error".into()));
        }
        if flags.body_written {
            return Err(ForecourtError::ServiceError("body written twice".into()));
        }
        flags.body_written = true;
        Ok(())
    }

    pub(crate) fn mark_error(&self) {
        self.inner.lock().errored = true;
    }

    pub(crate) fn is_completed(&self) -> bool {
        let flags = self.inner.lock();
        flags.body_written || flags.errored
    }
}

/// A dispatchable service body. Returning `false` tells the calling session
/// worker to terminate.
pub trait Service: Send + Sync {
    fn id(&self) -> u32;
    fn label(&self) -> &str;
    fn call(&self, request: Arc<dyn Request>, response: Arc<dyn Response>) -> bool;
}

/// Control command addressed to the routing layer itself rather than to a
/// registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum RoutingControl {
    UpdateExpirationTime,
}

/// Outcome of the routing-service chain. A decline is distinct from
/// "handled, terminate the worker": it means the chain does not recognize
/// the request and dispatch must fall through to the general service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingChainOutcome {
    /// The chain produced the response; the flag carries the same meaning
    /// as `Service::call`'s return value.
    Handled { keep_going: bool },
    /// Not a chain request; try the next dispatch tier.
    Declined,
}

/// Registry of services keyed by id; itself a service that dispatches on
/// the request's `service_id`.
pub struct RoutingService {
    services: RwLock<HashMap<u32, Arc<dyn Service>>>,
}

impl RoutingService {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, service: Arc<dyn Service>) -> Result<(), ForecourtError> {
        let mut services = self.services.write();
        let id = service.id();
        if services.contains_key(&id) {
            return Err(ForecourtError::ServiceError(format!(
                "service_id {id} registered twice"
            )));
        }
        services.insert(id, service);
        Ok(())
    }

    pub fn find(&self, service_id: u32) -> Option<Arc<dyn Service>> {
        self.services.read().get(&service_id).cloned()
    }

    /// First dispatch tier for requests addressed to `SERVICE_ID_ROUTING`:
    /// handles routing-layer control commands and declines everything else
    /// so the caller can fall through to the general service.
    pub fn route_chain(
        &self,
        request: Arc<dyn Request>,
        response: Arc<dyn Response>,
    ) -> RoutingChainOutcome {
        if request.service_id() != SERVICE_ID_ROUTING {
            return RoutingChainOutcome::Declined;
        }
        let Ok(control) = serde_json::from_slice::<RoutingControl>(request.payload()) else {
            return RoutingChainOutcome::Declined;
        };
        match control {
            RoutingControl::UpdateExpirationTime => {
                response.set_session_id(request.session_id());
                let keep_going = response.body(b"{}").is_ok();
                RoutingChainOutcome::Handled { keep_going }
            }
        }
    }
}

impl Default for RoutingService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for RoutingService {
    fn id(&self) -> u32 {
        SERVICE_ID_ROUTING
    }

    fn label(&self) -> &str {
        "routing_service"
    }

    fn call(&self, request: Arc<dyn Request>, response: Arc<dyn Response>) -> bool {
        response.set_session_id(request.session_id());
        let service_id = request.service_id();
        match self.find(service_id) {
            Some(service) => service.call(request, response),
            None => {
                warn!(service_id, "no service registered for request");
                response.error(Diagnostics::new(
                    DiagnosticCode::ServiceNotFound,
                    format!("service not found: service_id={service_id}"),
                ));
                true
            }
        }
    }
}
