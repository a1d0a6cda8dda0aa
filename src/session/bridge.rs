//! Session control service: list/get/shutdown and the typed variable
//! accessors, exposed to clients through the routing layer.

use crate::error::ForecourtError;
use crate::service::{Request, Response, SERVICE_ID_SESSION, Service};
use crate::session::{SessionEntry, SessionsCore, ShutdownRequest, VariableValue};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Command payload of a session control request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SessionCommand {
    SessionList,
    SessionGet {
        specifier: String,
    },
    SessionShutdown {
        specifier: String,
        request_type: ShutdownRequest,
    },
    SessionSetVariable {
        specifier: String,
        name: String,
        value: VariableValue,
    },
    SessionGetVariable {
        specifier: String,
        name: String,
    },
}

/// Reply body of a session control request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionReply {
    SessionList { entries: Vec<SessionEntry> },
    SessionGet { entry: SessionEntry },
    SessionShutdown,
    SessionSetVariable,
    SessionGetVariable { value: VariableValue },
    Error { code: String, message: String },
}

impl SessionReply {
    fn from_error(err: &ForecourtError) -> Self {
        SessionReply::Error {
            code: err.code_str().to_string(),
            message: err.to_string(),
        }
    }
}

/// Bridges the session registry into the service repository.
pub struct SessionBridge {
    sessions: Arc<SessionsCore>,
}

impl SessionBridge {
    pub fn new(sessions: Arc<SessionsCore>) -> Self {
        Self { sessions }
    }

    pub fn sessions(&self) -> &Arc<SessionsCore> {
        &self.sessions
    }

    fn handle(&self, command: SessionCommand) -> SessionReply {
        match command {
            SessionCommand::SessionList => SessionReply::SessionList {
                entries: self.sessions.session_list(),
            },
            SessionCommand::SessionGet { specifier } => {
                match self.sessions.get_session(&specifier) {
                    Ok(entry) => SessionReply::SessionGet { entry },
                    Err(err) => SessionReply::from_error(&err),
                }
            }
            SessionCommand::SessionShutdown {
                specifier,
                request_type,
            } => match self.sessions.shutdown_session(&specifier, request_type) {
                Ok(()) => SessionReply::SessionShutdown,
                Err(err) => SessionReply::from_error(&err),
            },
            SessionCommand::SessionSetVariable {
                specifier,
                name,
                value,
            } => match self.sessions.set_variable(&specifier, &name, value) {
                Ok(()) => SessionReply::SessionSetVariable,
                Err(err) => SessionReply::from_error(&err),
            },
            SessionCommand::SessionGetVariable { specifier, name } => {
                match self.sessions.get_variable(&specifier, &name) {
                    Ok(value) => SessionReply::SessionGetVariable { value },
                    Err(err) => SessionReply::from_error(&err),
                }
            }
        }
    }
}

impl Service for SessionBridge {
    fn id(&self) -> u32 {
        SERVICE_ID_SESSION
    }

    fn label(&self) -> &str {
        "session_service"
    }

    fn call(&self, request: Arc<dyn Request>, response: Arc<dyn Response>) -> bool {
        response.set_session_id(request.session_id());
        let reply = match serde_json::from_slice::<SessionCommand>(request.payload()) {
            Ok(command) => {
                debug!(session_id = request.session_id(), ?command, "session control command");
                self.handle(command)
            }
            Err(err) => SessionReply::Error {
                code: "service_error".to_string(),
                message: format!("malformed session command: {err}"),
            },
        };
        let body = serde_json::to_vec(&reply).unwrap_or_default();
        if let Err(err) = response.body(&body) {
            debug!(error = %err, "session control response body rejected");
        }
        true
    }
}
