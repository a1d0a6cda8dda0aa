use forecourt::config::ServerConfig;
use forecourt::endpoint::HandshakeRequest;
use forecourt::endpoint::stream::{FrameKind, StreamClient};
use forecourt::server::Server;
use forecourt::service::{DiagnosticCode, Diagnostics, Request, Response, Service};
use forecourt::session::ShutdownRequest;
use forecourt::session::bridge::{SessionCommand, SessionReply};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ECHO_SERVICE_ID: u32 = 100;

struct EchoService;

impl Service for EchoService {
    fn id(&self) -> u32 {
        ECHO_SERVICE_ID
    }

    fn label(&self) -> &str {
        "echo_service"
    }

    fn call(&self, request: Arc<dyn Request>, response: Arc<dyn Response>) -> bool {
        response.set_session_id(request.session_id());
        response.body(request.payload()).expect("body");
        true
    }
}

fn stream_server(max_sessions: usize) -> (Server, std::net::SocketAddr) {
    let mut config = ServerConfig::default();
    config.sql.thread_pool_size = 1;
    config.stream_endpoint.port = 0;
    config.stream_endpoint.threads = max_sessions;
    let server = Server::new(config).expect("server");
    server.add_service(Arc::new(EchoService)).expect("register echo");
    let endpoint = server.add_stream_endpoint();
    server.start().expect("start");
    let addr = endpoint.local_addr().expect("bound address");
    (server, addr)
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[test]
fn handshake_then_echo_over_tcp() {
    let (server, addr) = stream_server(8);

    let client = StreamClient::connect(addr).expect("connect");
    let session_id = client
        .handshake(&HandshakeRequest {
            label: "stream-L".to_string(),
            application: "tester".to_string(),
            user: "bob".to_string(),
        })
        .expect("handshake");

    assert!(wait_until(Duration::from_secs(5), || {
        server
            .sessions()
            .session_list()
            .iter()
            .any(|entry| entry.session_id == session_id && entry.label == "stream-L")
    }));

    client
        .send_request(3, ECHO_SERVICE_ID, b"over-tcp")
        .expect("send");
    let frame = client.recv().expect("echo frame");
    assert_eq!(frame.kind, FrameKind::Body);
    assert_eq!(frame.slot, 3);
    assert_eq!(frame.payload, b"over-tcp");

    server.shutdown().expect("shutdown");
}

#[test]
fn shutdown_flag_turns_later_requests_into_session_closed() {
    let (server, addr) = stream_server(8);

    let client = StreamClient::connect(addr).expect("connect");
    let session_id = client
        .handshake(&HandshakeRequest {
            label: "closing".to_string(),
            ..Default::default()
        })
        .expect("handshake");

    // queue the shutdown command and a follow-up request back to back so
    // the worker processes them in order
    let command = SessionCommand::SessionShutdown {
        specifier: format!(":{session_id}"),
        request_type: ShutdownRequest::Graceful,
    };
    client
        .send_request(
            1,
            forecourt::service::SERVICE_ID_SESSION,
            &serde_json::to_vec(&command).expect("encode"),
        )
        .expect("send shutdown");
    client
        .send_request(2, ECHO_SERVICE_ID, b"too-late")
        .expect("send echo");

    let reply = client.recv().expect("shutdown reply");
    assert_eq!(reply.kind, FrameKind::Body);
    assert_eq!(reply.slot, 1);
    let decoded: SessionReply = serde_json::from_slice(&reply.payload).expect("decode");
    assert_eq!(decoded, SessionReply::SessionShutdown);

    let diagnostic = client.recv().expect("diagnostic frame");
    assert_eq!(diagnostic.kind, FrameKind::Diagnostic);
    assert_eq!(diagnostic.slot, 2);
    let record: Diagnostics =
        serde_json::from_slice(&diagnostic.payload).expect("decode diagnostics");
    assert_eq!(record.code, DiagnosticCode::SessionClosed);

    // the worker notices the completed shutdown and closes the session
    assert!(wait_until(Duration::from_secs(5), || {
        server.sessions().session_list().is_empty()
    }));

    server.shutdown().expect("shutdown");
}

#[test]
fn session_bye_is_acknowledged() {
    let (server, addr) = stream_server(8);

    let client = StreamClient::connect(addr).expect("connect");
    client
        .handshake(&HandshakeRequest {
            label: "polite".to_string(),
            ..Default::default()
        })
        .expect("handshake");

    client.send_session_bye().expect("send bye");
    let frame = client.recv().expect("bye ok");
    assert_eq!(frame.kind, FrameKind::SessionByeOk);

    assert!(wait_until(Duration::from_secs(5), || {
        server.sessions().session_list().is_empty()
    }));
    server.shutdown().expect("shutdown");
}

#[test]
fn routing_requests_try_the_chain_then_fall_through() {
    // general service registered under the routing id: the second dispatch
    // tier for chain-declined requests
    struct GeneralService;
    impl Service for GeneralService {
        fn id(&self) -> u32 {
            forecourt::service::SERVICE_ID_ROUTING
        }
        fn label(&self) -> &str {
            "general_service"
        }
        fn call(&self, request: Arc<dyn Request>, response: Arc<dyn Response>) -> bool {
            response.set_session_id(request.session_id());
            response.body(b"fallback").expect("body");
            true
        }
    }

    let mut config = ServerConfig::default();
    config.sql.thread_pool_size = 1;
    config.stream_endpoint.port = 0;
    config.stream_endpoint.threads = 4;
    let server = Server::new(config).expect("server");
    server
        .add_service(Arc::new(GeneralService))
        .expect("register general service");
    let endpoint = server.add_stream_endpoint();
    server.start().expect("start");
    let addr = endpoint.local_addr().expect("bound address");

    let client = StreamClient::connect(addr).expect("connect");
    client
        .handshake(&HandshakeRequest {
            label: "chained".to_string(),
            ..Default::default()
        })
        .expect("handshake");

    // a recognized control command is answered by the chain itself
    client
        .send_request(
            4,
            forecourt::service::SERVICE_ID_ROUTING,
            br#"{"command":"update_expiration_time"}"#,
        )
        .expect("send control");
    let frame = client.recv().expect("chain reply");
    assert_eq!(frame.kind, FrameKind::Body);
    assert_eq!(frame.slot, 4);
    assert_eq!(frame.payload, b"{}");

    // anything the chain declines lands on the general service
    client
        .send_request(5, forecourt::service::SERVICE_ID_ROUTING, b"not a control op")
        .expect("send declined");
    let frame = client.recv().expect("fallback reply");
    assert_eq!(frame.kind, FrameKind::Body);
    assert_eq!(frame.slot, 5);
    assert_eq!(frame.payload, b"fallback");

    server.shutdown().expect("shutdown");
}

#[test]
fn over_capacity_connections_are_declined() {
    let (server, addr) = stream_server(1);

    let first = StreamClient::connect(addr).expect("first connect");
    first
        .handshake(&HandshakeRequest {
            label: "occupant".to_string(),
            ..Default::default()
        })
        .expect("handshake");

    let second = StreamClient::connect(addr).expect("second connect");
    let err = second
        .handshake(&HandshakeRequest {
            label: "crowded".to_string(),
            ..Default::default()
        })
        .expect_err("must be declined");
    let message = err.to_string();
    assert!(
        message.contains("maximum number of sessions"),
        "unexpected decline message: {message}"
    );

    server.shutdown().expect("shutdown");
}

#[test]
fn expired_sessions_are_forcefully_shut_down() {
    let mut config = ServerConfig::default();
    config.sql.thread_pool_size = 1;
    config.stream_endpoint.port = 0;
    config.stream_endpoint.threads = 4;
    let server = Server::new(config).expect("server");
    server.add_service(Arc::new(EchoService)).expect("register echo");

    let mut endpoint = forecourt::endpoint::stream::StreamEndpoint::new(
        &server.config().stream_endpoint,
        server.routing(),
        server.sessions(),
        server.database_info(),
    );
    endpoint.set_session_expiration(Some(Duration::from_millis(50)));
    let endpoint = Arc::new(endpoint);
    server.add_endpoint(Arc::clone(&endpoint) as Arc<dyn forecourt::endpoint::Endpoint>);
    server.start().expect("start");
    let addr = endpoint.local_addr().expect("bound address");

    let client = StreamClient::connect(addr).expect("connect");
    let session_id = client
        .handshake(&HandshakeRequest {
            label: "idler".to_string(),
            ..Default::default()
        })
        .expect("handshake");
    assert!(session_id > 0);

    // past the expiration the housekeeping arm forces the session out
    assert!(wait_until(Duration::from_secs(5), || {
        server.sessions().session_list().is_empty()
    }));

    server.shutdown().expect("shutdown");
}
