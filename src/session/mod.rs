//! Session lifecycle: the per-session context (shutdown flag, variable set),
//! the process-wide registry, and the control-service bridge.

pub mod bridge;

use crate::error::ForecourtError;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

static NEXT_NUMERIC_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique session id. Ids are monotonic and never
/// reused within the process lifetime.
pub fn next_session_id() -> u64 {
    NEXT_NUMERIC_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownRequest {
    None = 0,
    /// Drain in-flight requests, then stop.
    Graceful = 1,
    /// Cancel in-flight requests and stop.
    Forceful = 2,
}

impl ShutdownRequest {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ShutdownRequest::Graceful,
            2 => ShutdownRequest::Forceful,
            _ => ShutdownRequest::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Ipc,
    Stream,
    Loopback,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::Ipc => write!(f, "ipc"),
            ConnectionType::Stream => write!(f, "stream"),
            ConnectionType::Loopback => write!(f, "loopback"),
        }
    }
}

/// Snapshot of who is on the other end of a session, fixed at handshake.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: u64,
    /// Symbolic label; may duplicate across sessions.
    pub label: String,
    pub application: String,
    pub user: String,
    pub connection_type: ConnectionType,
    pub connection_info: String,
    pub start_time: SystemTime,
}

impl SessionInfo {
    pub fn new(session_id: u64, connection_type: ConnectionType, connection_info: impl Into<String>) -> Self {
        Self {
            session_id,
            label: String::new(),
            application: String::new(),
            user: String::new(),
            connection_type,
            connection_info: connection_info.into(),
            start_time: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    Bool,
    SignedInteger,
    UnsignedInteger,
    String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum VariableValue {
    Bool(bool),
    SignedInteger(i64),
    UnsignedInteger(u64),
    String(String),
}

impl VariableValue {
    pub fn variable_type(&self) -> VariableType {
        match self {
            VariableValue::Bool(_) => VariableType::Bool,
            VariableValue::SignedInteger(_) => VariableType::SignedInteger,
            VariableValue::UnsignedInteger(_) => VariableType::UnsignedInteger,
            VariableValue::String(_) => VariableType::String,
        }
    }
}

/// Typed per-session key-value store. Variable names and their types are
/// declared at session creation; `set` must match the declared type.
pub struct SessionVariableSet {
    declarations: HashMap<String, VariableType>,
    values: Mutex<HashMap<String, VariableValue>>,
}

impl SessionVariableSet {
    pub fn new(declarations: Vec<(String, VariableType, VariableValue)>) -> Self {
        let mut types = HashMap::new();
        let mut values = HashMap::new();
        for (name, variable_type, initial) in declarations {
            debug_assert_eq!(initial.variable_type(), variable_type);
            types.insert(name.clone(), variable_type);
            values.insert(name, initial);
        }
        Self {
            declarations: types,
            values: Mutex::new(values),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn declared_type(&self, name: &str) -> Option<VariableType> {
        self.declarations.get(name).copied()
    }

    pub fn get(&self, name: &str) -> Result<VariableValue, ForecourtError> {
        self.values
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ForecourtError::VariableTypeMismatch {
                name: name.to_string(),
            })
    }

    pub fn set(&self, name: &str, value: VariableValue) -> Result<(), ForecourtError> {
        let declared = self
            .declared_type(name)
            .ok_or_else(|| ForecourtError::VariableTypeMismatch {
                name: name.to_string(),
            })?;
        if value.variable_type() != declared {
            return Err(ForecourtError::VariableTypeMismatch {
                name: name.to_string(),
            });
        }
        self.values.lock().insert(name.to_string(), value);
        Ok(())
    }
}

/// Per-session storage for service-side data, keyed by service id. Owned by
/// the session worker and disposed when the worker exits.
#[derive(Default)]
pub struct SessionStore {
    entries: Mutex<HashMap<u32, Arc<dyn Any + Send + Sync>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts data for `service_id`; false when an entry already exists.
    pub fn put(&self, service_id: u32, data: Arc<dyn Any + Send + Sync>) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&service_id) {
            return false;
        }
        entries.insert(service_id, data);
        true
    }

    pub fn find<T: Send + Sync + 'static>(&self, service_id: u32) -> Option<Arc<T>> {
        self.entries
            .lock()
            .get(&service_id)
            .cloned()
            .and_then(|data| data.downcast::<T>().ok())
    }

    pub fn remove(&self, service_id: u32) -> bool {
        self.entries.lock().remove(&service_id).is_some()
    }

    pub fn dispose(&self) {
        self.entries.lock().clear();
    }
}

/// Mutable state bound to one session. The session worker holds the strong
/// reference; the registry keeps only a weak back-reference.
pub struct SessionContext {
    info: SessionInfo,
    variables: SessionVariableSet,
    shutdown_request: AtomicU8,
}

impl SessionContext {
    pub fn new(info: SessionInfo, variables: SessionVariableSet) -> Self {
        Self {
            info,
            variables,
            shutdown_request: AtomicU8::new(ShutdownRequest::None as u8),
        }
    }

    pub fn numeric_id(&self) -> u64 {
        self.info.session_id
    }

    pub fn label(&self) -> &str {
        &self.info.label
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn variables(&self) -> &SessionVariableSet {
        &self.variables
    }

    pub fn shutdown_request(&self) -> ShutdownRequest {
        ShutdownRequest::from_u8(self.shutdown_request.load(Ordering::Acquire))
    }

    /// Records a shutdown request. Requests only escalate: forceful
    /// overrides graceful, graceful never downgrades forceful. Returns
    /// whether the stored state now matches the requested type.
    pub fn request_shutdown(&self, request: ShutdownRequest) -> bool {
        let requested = request as u8;
        let mut current = self.shutdown_request.load(Ordering::Acquire);
        loop {
            if current >= requested {
                return current == requested;
            }
            match self.shutdown_request.compare_exchange(
                current,
                requested,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn entry(&self) -> SessionEntry {
        SessionEntry {
            session_id: self.info.session_id,
            label: self.info.label.clone(),
            application: self.info.application.clone(),
            user: self.info.user.clone(),
            connection_type: self.info.connection_type,
            connection_info: self.info.connection_info.clone(),
            start_time: self.info.start_time,
        }
    }
}

/// One row of a session list snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: u64,
    pub label: String,
    pub application: String,
    pub user: String,
    pub connection_type: ConnectionType,
    pub connection_info: String,
    pub start_time: SystemTime,
}

/// Process-wide registry of live sessions. Holds weak back-references only,
/// so a session disappears from snapshots as soon as its worker drops the
/// strong reference.
pub struct SessionsCore {
    sessions: RwLock<HashMap<u64, Weak<SessionContext>>>,
}

impl SessionsCore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts the session keyed by its numeric id; false when a live
    /// session with that id is already present.
    pub fn register_session(&self, context: &Arc<SessionContext>) -> bool {
        let mut sessions = self.sessions.write();
        let id = context.numeric_id();
        if let Some(existing) = sessions.get(&id) {
            if existing.upgrade().is_some() {
                return false;
            }
        }
        sessions.insert(id, Arc::downgrade(context));
        true
    }

    pub fn unregister_session(&self, numeric_id: u64) {
        self.sessions.write().remove(&numeric_id);
    }

    pub fn session_list(&self) -> Vec<SessionEntry> {
        let mut entries: Vec<SessionEntry> = self
            .sessions
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .map(|ctx| ctx.entry())
            .collect();
        entries.sort_by_key(|entry| entry.session_id);
        entries
    }

    /// Resolves a specifier, either `":<numeric_id>"` or a label. A label
    /// matching more than one live session is ambiguous.
    pub fn find_session(&self, specifier: &str) -> Result<Arc<SessionContext>, ForecourtError> {
        let sessions = self.sessions.read();
        if let Some(raw) = specifier.strip_prefix(':') {
            let numeric_id: u64 = raw
                .parse()
                .map_err(|_| ForecourtError::SessionNotFound)?;
            return sessions
                .get(&numeric_id)
                .and_then(Weak::upgrade)
                .ok_or(ForecourtError::SessionNotFound);
        }
        let mut matches = sessions
            .values()
            .filter_map(Weak::upgrade)
            .filter(|ctx| ctx.label() == specifier);
        let found = matches.next().ok_or(ForecourtError::SessionNotFound)?;
        if matches.next().is_some() {
            return Err(ForecourtError::SessionAmbiguous);
        }
        Ok(found)
    }

    /// Flags the target session for shutdown. Asking for a weaker shutdown
    /// than the one already pending reports `ShutdownInProgress`.
    pub fn shutdown_session(
        &self,
        specifier: &str,
        request: ShutdownRequest,
    ) -> Result<(), ForecourtError> {
        let context = self.find_session(specifier)?;
        if context.request_shutdown(request) {
            Ok(())
        } else {
            Err(ForecourtError::ShutdownInProgress)
        }
    }

    pub fn get_session(&self, specifier: &str) -> Result<SessionEntry, ForecourtError> {
        Ok(self.find_session(specifier)?.entry())
    }

    pub fn set_variable(
        &self,
        specifier: &str,
        name: &str,
        value: VariableValue,
    ) -> Result<(), ForecourtError> {
        self.find_session(specifier)?.variables().set(name, value)
    }

    pub fn get_variable(
        &self,
        specifier: &str,
        name: &str,
    ) -> Result<VariableValue, ForecourtError> {
        self.find_session(specifier)?.variables().get(name)
    }

    /// Drops registry entries whose worker is gone. List and find skip dead
    /// entries anyway; this keeps the map small on long-lived servers.
    pub fn collect_expired(&self) {
        self.sessions
            .write()
            .retain(|_, weak| weak.upgrade().is_some());
    }
}

impl Default for SessionsCore {
    fn default() -> Self {
        Self::new()
    }
}
