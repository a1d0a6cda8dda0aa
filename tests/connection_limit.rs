use forecourt::config::ServerConfig;
use forecourt::endpoint::ipc::IpcClient;
use forecourt::error::{ForecourtError, ForecourtErrorCode};
use forecourt::server::Server;

fn server_with_budget(threads: usize, admin_sessions: usize) -> (Server, std::sync::Arc<forecourt::endpoint::ipc::IpcEndpoint>) {
    let mut config = ServerConfig::default();
    config.sql.thread_pool_size = 1;
    config.ipc_endpoint.database_name = format!("connection_limit_{threads}_{admin_sessions}");
    config.ipc_endpoint.threads = threads;
    config.ipc_endpoint.admin_sessions = admin_sessions;
    let server = Server::new(config).expect("server");
    let endpoint = server.add_ipc_endpoint();
    server.start().expect("start");
    (server, endpoint)
}

fn assert_limit_reached(err: ForecourtError) {
    assert_eq!(err.code(), ForecourtErrorCode::ResourceLimitReached);
}

#[test]
fn normal_budget_exhausts_at_the_thread_count() {
    let (server, endpoint) = server_with_budget(104, 1);
    let container = endpoint.container();

    let mut sessions = Vec::new();
    for _ in 0..104 {
        sessions.push(IpcClient::connect(&container).expect("connect"));
    }
    assert_limit_reached(IpcClient::connect(&container).expect_err("105th must fail"));

    // the reserved admin budget still admits one session
    let admin = IpcClient::connect_admin(&container).expect("admin connect");
    assert_limit_reached(IpcClient::connect(&container).expect_err("normal after admin"));
    assert_limit_reached(IpcClient::connect_admin(&container).expect_err("second admin"));

    for session in &sessions {
        session.close();
    }
    admin.close();
    server.shutdown().expect("shutdown");
}

#[test]
fn closing_a_session_returns_its_budget() {
    let (server, endpoint) = server_with_budget(1, 0);
    let container = endpoint.container();

    let first = IpcClient::connect(&container).expect("connect");
    assert_limit_reached(IpcClient::connect(&container).expect_err("budget exhausted"));
    first.close();

    // the worker releases the slot when it notices the close
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    let reconnected = loop {
        match IpcClient::connect(&container) {
            Ok(client) => break client,
            Err(_) if std::time::Instant::now() < deadline => {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            Err(err) => panic!("slot never came back: {err}"),
        }
    };
    reconnected.close();
    server.shutdown().expect("shutdown");
}
