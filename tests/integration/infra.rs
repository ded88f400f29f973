use crate::*;

use rtmp_core::amf::AmfType;

#[tokio::test]
async fn test_digest_handshake_verifies() {
    let server = start_server(test_config()).unwrap();
    let client = Client::connect(server.addr).await.unwrap();
    assert!(!client.handshake.is_legacy(), "server answered in digest mode");
    assert_eq!(client.handshake.response_verified(), Some(true));
}

#[tokio::test]
async fn test_minimal_connect() {
    let server = start_server(test_config()).unwrap();
    let mut client = Client::connect(server.addr).await.unwrap();
    client.command(&connect_values("live")).await.unwrap();

    let ack = client.recv().await.unwrap();
    assert_eq!(ack.header.msg_type, MessageType::AckWindow as u8);
    assert_eq!(ack.header.csid, 2);
    let bw = client.recv().await.unwrap();
    assert_eq!(bw.header.msg_type, MessageType::PeerBandwidth as u8);
    let cs = client.recv().await.unwrap();
    assert_eq!(cs.header.msg_type, MessageType::SetChunkSize as u8);
    assert_eq!(cs.payload.to_vec(), 4096u32.to_be_bytes());

    let result = client.recv().await.unwrap();
    assert_eq!(result.header.msg_type, MessageType::AmfCommand as u8);
    let mut name = String::new();
    let mut trans = 0.0;
    let mut fms_ver = String::new();
    let mut code = String::new();
    let mut server_props = [Elt::string("fmsVer", &mut fms_ver)];
    let mut info = [Elt::string("code", &mut code)];
    let mut elts = [
        Elt::string("", &mut name),
        Elt::number("", &mut trans),
        Elt::object("", &mut server_props),
        Elt::object("", &mut info),
    ];
    amf::decode(&mut Cursor::from_chain(&result.payload), &mut elts).unwrap();
    assert_eq!(name, "_result");
    assert_eq!(trans, 1.0);
    assert_eq!(fms_ver, "FMS/3,0,1,123");
    assert_eq!(code, "NetConnection.Connect.Success");

    client
        .command(&[Value::string("createStream"), Value::Number(2.0), Value::Null])
        .await
        .unwrap();
    let reply = client.recv_type(MessageType::AmfCommand).await.unwrap();
    let mut id = 0.0;
    amf::decode(
        &mut Cursor::from_chain(&reply.payload),
        &mut [
            Elt::skip(AmfType::String, ""),
            Elt::skip(AmfType::Number, ""),
            Elt::null(""),
            Elt::number("", &mut id),
        ],
    )
    .unwrap();
    assert_eq!(id, 1.0);
}

#[tokio::test]
async fn test_oversized_message_closes_connection() {
    let mut config = test_config();
    config.chunk.max_message = 1024;
    let server = start_server(config).unwrap();
    let mut client = Client::connect(server.addr).await.unwrap();

    // Format 0 on csid 3 declaring 2048 bytes of AMF0 command, no payload.
    client
        .send_raw(&[0x03, 0, 0, 0, 0x00, 0x08, 0x00, 20, 0, 0, 0, 0])
        .await
        .unwrap();
    client.expect_closed().await.unwrap();
}

#[tokio::test]
async fn test_unmatched_command_keeps_alignment() {
    let server = start_server(test_config()).unwrap();
    let mut client = Client::connect(server.addr).await.unwrap();

    client
        .command(&[Value::string("ping-test"), Value::Number(5.0)])
        .await
        .unwrap();
    client
        .command(&[Value::string("createStream"), Value::Number(9.0), Value::Null])
        .await
        .unwrap();

    let reply = client.recv_type(MessageType::AmfCommand).await.unwrap();
    assert_eq!(reply_head(&reply).unwrap(), ("_result".to_string(), 9.0));
}

#[tokio::test]
async fn test_large_command_after_chunk_size_change() {
    let server = start_server(test_config()).unwrap();
    let mut client = Client::connect(server.addr).await.unwrap();
    client.set_chunk_size(60).await.unwrap();

    let url = format!("rtmp://127.0.0.1/live?{}", "k".repeat(500));
    let mut values = connect_values("live");
    values[2] = Value::object([("app", Value::string("live")), ("tcUrl", Value::string(url))]);
    client.command(&values).await.unwrap();

    let result = client.recv_type(MessageType::AmfCommand).await.unwrap();
    assert_eq!(reply_head(&result).unwrap(), ("_result".to_string(), 1.0));
}

#[tokio::test]
async fn test_unknown_application_rejected() {
    let mut config = test_config();
    config.server.applications = vec!["live".into()];
    let server = start_server(config).unwrap();
    let mut client = Client::connect(server.addr).await.unwrap();

    client.command(&connect_values("private")).await.unwrap();
    client.expect_closed().await.unwrap();
}

#[tokio::test]
async fn test_idle_client_gets_pinged() {
    let mut config = test_config();
    config.timeouts.ping_ms = 100;
    config.timeouts.ping_timeout_ms = 5000;
    let server = start_server(config).unwrap();
    let mut client = Client::connect(server.addr).await.unwrap();

    let ping = client.recv().await.unwrap();
    assert!(is_ping_request(&ping), "expected a ping request");
}

#[tokio::test]
async fn test_unanswered_ping_closes_connection() {
    let mut config = test_config();
    config.timeouts.ping_ms = 100;
    config.timeouts.ping_timeout_ms = 100;
    let server = start_server(config).unwrap();
    let mut client = Client::connect(server.addr).await.unwrap();
    client.expect_closed().await.unwrap();
}
