//! Component assembly: wires the scheduler, routing registry, session
//! registry, and endpoints together behind the `setup → start → shutdown`
//! lifecycle. Components start in registration order and shut down in
//! reverse.

use crate::config::ServerConfig;
use crate::endpoint::Endpoint;
use crate::endpoint::ipc::IpcEndpoint;
use crate::endpoint::loopback::LoopbackEndpoint;
use crate::endpoint::stream::StreamEndpoint;
use crate::error::ForecourtError;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::service::{DatabaseInfo, RoutingService, Service};
use crate::session::SessionsCore;
use crate::session::bridge::SessionBridge;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Created,
    Ready,
    Activated,
    Deactivated,
}

pub struct Server {
    config: ServerConfig,
    database_info: Arc<DatabaseInfo>,
    sessions: Arc<SessionsCore>,
    routing: Arc<RoutingService>,
    scheduler: Arc<Scheduler>,
    endpoints: Mutex<Vec<Arc<dyn Endpoint>>>,
    state: Mutex<LifecycleState>,
}

impl Server {
    /// Builds the core components from configuration. The session control
    /// bridge is always registered; endpoints are added explicitly.
    pub fn new(config: ServerConfig) -> Result<Self, ForecourtError> {
        let database_info = Arc::new(DatabaseInfo::new(config.ipc_endpoint.database_name.clone()));
        let sessions = Arc::new(SessionsCore::new());
        let routing = Arc::new(RoutingService::new());
        routing.register(Arc::new(SessionBridge::new(Arc::clone(&sessions))))?;
        let scheduler = Arc::new(Scheduler::new(SchedulerConfig {
            thread_count: config.sql.thread_pool_size,
            lazy_worker: config.sql.lazy_worker,
            ..Default::default()
        }));
        Ok(Self {
            config,
            database_info,
            sessions,
            routing,
            scheduler,
            endpoints: Mutex::new(Vec::new()),
            state: Mutex::new(LifecycleState::Created),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn database_info(&self) -> Arc<DatabaseInfo> {
        Arc::clone(&self.database_info)
    }

    pub fn sessions(&self) -> Arc<SessionsCore> {
        Arc::clone(&self.sessions)
    }

    pub fn routing(&self) -> Arc<RoutingService> {
        Arc::clone(&self.routing)
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn add_service(&self, service: Arc<dyn Service>) -> Result<(), ForecourtError> {
        self.routing.register(service)
    }

    pub fn add_endpoint(&self, endpoint: Arc<dyn Endpoint>) {
        self.endpoints.lock().push(endpoint);
    }

    /// Creates and registers the IPC endpoint from `[ipc_endpoint]`.
    pub fn add_ipc_endpoint(&self) -> Arc<IpcEndpoint> {
        let endpoint = Arc::new(IpcEndpoint::new(
            &self.config.ipc_endpoint,
            self.routing(),
            self.sessions(),
            self.database_info(),
        ));
        self.add_endpoint(Arc::clone(&endpoint) as Arc<dyn Endpoint>);
        endpoint
    }

    /// Creates and registers the stream endpoint from `[stream_endpoint]`.
    pub fn add_stream_endpoint(&self) -> Arc<StreamEndpoint> {
        let endpoint = Arc::new(StreamEndpoint::new(
            &self.config.stream_endpoint,
            self.routing(),
            self.sessions(),
            self.database_info(),
        ));
        self.add_endpoint(Arc::clone(&endpoint) as Arc<dyn Endpoint>);
        endpoint
    }

    /// Creates and registers the loopback endpoint.
    pub fn add_loopback_endpoint(&self) -> Arc<LoopbackEndpoint> {
        let endpoint = Arc::new(LoopbackEndpoint::new(
            self.routing(),
            self.database_info(),
        ));
        self.add_endpoint(Arc::clone(&endpoint) as Arc<dyn Endpoint>);
        endpoint
    }

    /// Sets up every endpoint in registration order.
    pub fn setup(&self) -> Result<(), ForecourtError> {
        let mut state = self.state.lock();
        if *state != LifecycleState::Created {
            return Ok(());
        }
        for endpoint in self.endpoints.lock().iter() {
            endpoint.setup()?;
        }
        *state = LifecycleState::Ready;
        Ok(())
    }

    /// Starts the scheduler and every endpoint in registration order.
    pub fn start(&self) -> Result<(), ForecourtError> {
        self.setup()?;
        let mut state = self.state.lock();
        if *state == LifecycleState::Activated {
            return Ok(());
        }
        self.scheduler.start();
        for endpoint in self.endpoints.lock().iter() {
            endpoint.start()?;
        }
        *state = LifecycleState::Activated;
        info!(database = %self.database_info.name, "server started");
        Ok(())
    }

    /// Shuts endpoints down in reverse registration order, then stops the
    /// scheduler. Safe to call multiple times.
    pub fn shutdown(&self) -> Result<(), ForecourtError> {
        let mut state = self.state.lock();
        if *state == LifecycleState::Deactivated {
            return Ok(());
        }
        let was_activated = *state == LifecycleState::Activated;
        for endpoint in self.endpoints.lock().iter().rev() {
            if was_activated {
                endpoint.shutdown()?;
            }
        }
        self.scheduler.stop();
        *state = LifecycleState::Deactivated;
        info!(database = %self.database_info.name, "server stopped");
        Ok(())
    }
}
