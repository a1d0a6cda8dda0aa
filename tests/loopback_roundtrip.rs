use forecourt::config::ServerConfig;
use forecourt::server::Server;
use forecourt::service::{DataChannel, DataWriter, Request, Response, ResponseCode, Service};
use std::sync::Arc;

const NCHANNEL: usize = 2;
const NWRITE: usize = 2;
const NLOOP: usize = 2;
const BODY_HEAD: &[u8] = b"body_head";

fn channel_name(ch: usize) -> String {
    format!("ch{ch}")
}

fn channel_data(ch: usize, w: usize, i: usize) -> String {
    format!("ch{ch}-w{w}-{i}")
}

/// Echoes the payload and writes a deterministic sequence to named data
/// channels.
struct DataChannelService;

impl DataChannelService {
    const TAG: u32 = 1234;
}

impl Service for DataChannelService {
    fn id(&self) -> u32 {
        Self::TAG
    }

    fn label(&self) -> &str {
        "loopback:data_channel_service"
    }

    fn call(&self, request: Arc<dyn Request>, response: Arc<dyn Response>) -> bool {
        response.set_session_id(request.session_id());
        response.set_code(ResponseCode::Success);
        response.body_head(BODY_HEAD).expect("body_head");
        for ch in 0..NCHANNEL {
            let channel = response
                .acquire_channel(&channel_name(ch))
                .expect("acquire channel");
            for w in 0..NWRITE {
                let writer = channel.acquire_writer().expect("acquire writer");
                for i in 0..NLOOP {
                    writer
                        .write(channel_data(ch, w, i).as_bytes())
                        .expect("write");
                    writer.commit().expect("commit");
                }
                channel.release_writer(writer).expect("release writer");
            }
            response.release_channel(channel).expect("release channel");
        }
        response.body(request.payload()).expect("body");
        true
    }
}

#[test]
fn loopback_round_trip_with_data_channels() {
    let session_id = 123u64;
    let payload = b"loopback_test";

    let server = Server::new(ServerConfig::default()).expect("server");
    server
        .add_service(Arc::new(DataChannelService))
        .expect("register service");
    let loopback = server.add_loopback_endpoint();
    server.start().expect("start");

    let response = loopback
        .request(session_id, DataChannelService::TAG, payload)
        .expect("request");
    assert_eq!(response.session_id(), session_id);
    assert_eq!(response.code(), ResponseCode::Success);
    assert_eq!(response.body_head(), BODY_HEAD.to_vec());
    assert_eq!(response.body(), payload.to_vec());

    for ch in 0..NCHANNEL {
        let data = response.channel(&channel_name(ch));
        assert_eq!(data.len(), NWRITE * NLOOP);
        let mut idx = 0;
        for w in 0..NWRITE {
            for i in 0..NLOOP {
                assert_eq!(
                    data[idx],
                    channel_data(ch, w, i).into_bytes(),
                    "channel {ch} entry {idx}"
                );
                idx += 1;
            }
        }
    }

    server.shutdown().expect("shutdown");
}

#[test]
fn loopback_echo_body_equals_request_payload() {
    struct EchoService;
    impl Service for EchoService {
        fn id(&self) -> u32 {
            77
        }
        fn label(&self) -> &str {
            "echo"
        }
        fn call(&self, request: Arc<dyn Request>, response: Arc<dyn Response>) -> bool {
            response.set_session_id(request.session_id());
            response.body(request.payload()).expect("body");
            true
        }
    }

    let server = Server::new(ServerConfig::default()).expect("server");
    server.add_service(Arc::new(EchoService)).expect("register");
    let loopback = server.add_loopback_endpoint();
    server.start().expect("start");

    let response = loopback.request(1, 77, b"ping").expect("request");
    assert_eq!(response.body(), b"ping".to_vec());

    // unknown service id surfaces a diagnostics record, not a body
    let response = loopback.request(1, 9999, b"ping").expect("request");
    assert!(response.body().is_empty());
    let diagnostics = response.diagnostics().expect("diagnostics record");
    assert_eq!(
        diagnostics.code,
        forecourt::service::DiagnosticCode::ServiceNotFound
    );

    server.shutdown().expect("shutdown");
}
