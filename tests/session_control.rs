use forecourt::config::ServerConfig;
use forecourt::server::Server;
use forecourt::service::SERVICE_ID_SESSION;
use forecourt::session::bridge::{SessionCommand, SessionReply};
use forecourt::session::{
    ConnectionType, SessionContext, SessionInfo, SessionVariableSet, SessionsCore,
    ShutdownRequest, VariableType, VariableValue,
};
use std::sync::Arc;

fn make_context(session_id: u64, label: &str) -> Arc<SessionContext> {
    let mut info = SessionInfo::new(session_id, ConnectionType::Ipc, "9999");
    info.label = label.to_string();
    info.application = "application_for_test".to_string();
    info.user = "user_for_test".to_string();
    Arc::new(SessionContext::new(
        info,
        SessionVariableSet::new(vec![(
            "test_integer".to_string(),
            VariableType::SignedInteger,
            VariableValue::SignedInteger(123),
        )]),
    ))
}

fn send(
    loopback: &forecourt::endpoint::loopback::LoopbackEndpoint,
    command: &SessionCommand,
) -> SessionReply {
    let payload = serde_json::to_vec(command).expect("encode command");
    let response = loopback
        .request(10, SERVICE_ID_SESSION, &payload)
        .expect("request");
    assert_eq!(response.session_id(), 10);
    serde_json::from_slice(&response.body()).expect("decode reply")
}

#[test]
fn session_list_get_shutdown_and_gc() {
    let server = Server::new(ServerConfig::default()).expect("server");
    let loopback = server.add_loopback_endpoint();
    server.start().expect("start");

    // nothing registered yet
    match send(&loopback, &SessionCommand::SessionList) {
        SessionReply::SessionList { entries } => assert!(entries.is_empty()),
        other => panic!("unexpected reply: {other:?}"),
    }

    let context = make_context(111, "L");
    assert!(server.sessions().register_session(&context));

    match send(&loopback, &SessionCommand::SessionList) {
        SessionReply::SessionList { entries } => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].session_id, 111);
            assert_eq!(entries[0].label, "L");
            assert_eq!(entries[0].application, "application_for_test");
            assert_eq!(entries[0].user, "user_for_test");
            assert_eq!(entries[0].connection_type, ConnectionType::Ipc);
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    // both specifier spellings resolve to the same session
    for specifier in [":111", "L"] {
        match send(
            &loopback,
            &SessionCommand::SessionGet {
                specifier: specifier.to_string(),
            },
        ) {
            SessionReply::SessionGet { entry } => assert_eq!(entry.session_id, 111),
            other => panic!("unexpected reply for {specifier}: {other:?}"),
        }
    }

    match send(
        &loopback,
        &SessionCommand::SessionShutdown {
            specifier: ":111".to_string(),
            request_type: ShutdownRequest::Graceful,
        },
    ) {
        SessionReply::SessionShutdown => {}
        other => panic!("unexpected reply: {other:?}"),
    }
    assert_eq!(context.shutdown_request(), ShutdownRequest::Graceful);

    drop(context);
    match send(&loopback, &SessionCommand::SessionList) {
        SessionReply::SessionList { entries } => assert!(entries.is_empty()),
        other => panic!("unexpected reply: {other:?}"),
    }

    server.shutdown().expect("shutdown");
}

#[test]
fn session_get_reports_not_found_and_ambiguous() {
    let server = Server::new(ServerConfig::default()).expect("server");
    let loopback = server.add_loopback_endpoint();
    server.start().expect("start");

    match send(
        &loopback,
        &SessionCommand::SessionGet {
            specifier: ":404".to_string(),
        },
    ) {
        SessionReply::Error { code, .. } => assert_eq!(code, "session_not_found"),
        other => panic!("unexpected reply: {other:?}"),
    }

    let a = make_context(1, "dup");
    let b = make_context(2, "dup");
    server.sessions().register_session(&a);
    server.sessions().register_session(&b);
    match send(
        &loopback,
        &SessionCommand::SessionGet {
            specifier: "dup".to_string(),
        },
    ) {
        SessionReply::Error { code, .. } => assert_eq!(code, "session_ambiguous"),
        other => panic!("unexpected reply: {other:?}"),
    }

    server.shutdown().expect("shutdown");
}

#[test]
fn variables_round_trip_through_the_bridge() {
    let server = Server::new(ServerConfig::default()).expect("server");
    let loopback = server.add_loopback_endpoint();
    server.start().expect("start");

    let context = make_context(5, "vars");
    server.sessions().register_session(&context);

    match send(
        &loopback,
        &SessionCommand::SessionSetVariable {
            specifier: ":5".to_string(),
            name: "test_integer".to_string(),
            value: VariableValue::SignedInteger(-7),
        },
    ) {
        SessionReply::SessionSetVariable => {}
        other => panic!("unexpected reply: {other:?}"),
    }
    match send(
        &loopback,
        &SessionCommand::SessionGetVariable {
            specifier: ":5".to_string(),
            name: "test_integer".to_string(),
        },
    ) {
        SessionReply::SessionGetVariable { value } => {
            assert_eq!(value, VariableValue::SignedInteger(-7));
        }
        other => panic!("unexpected reply: {other:?}"),
    }
    // a value of the wrong declared type is refused
    match send(
        &loopback,
        &SessionCommand::SessionSetVariable {
            specifier: ":5".to_string(),
            name: "test_integer".to_string(),
            value: VariableValue::String("oops".to_string()),
        },
    ) {
        SessionReply::Error { code, .. } => assert_eq!(code, "variable_type_mismatch"),
        other => panic!("unexpected reply: {other:?}"),
    }

    server.shutdown().expect("shutdown");
}

#[test]
fn registry_skips_dead_sessions_without_resurrecting_ids() {
    let sessions = SessionsCore::new();
    let first = make_context(900, "gone");
    sessions.register_session(&first);
    drop(first);
    assert!(sessions.session_list().is_empty());
    assert!(sessions.find_session(":900").is_err());
    sessions.collect_expired();
    assert!(sessions.session_list().is_empty());
}
