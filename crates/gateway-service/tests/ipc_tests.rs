use gateway_core::GatewaySettings;
use gateway_service::host::GatewayHost;
use gateway_service::ipc::{
    read_envelope, serve_connection, write_envelope, Call, Hello, OutcomeStatus, WireEnvelope,
    PROTOCOL_VERSION,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct Client {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    server: JoinHandle<anyhow::Result<()>>,
}

impl Client {
    fn connect(host: &Arc<GatewayHost>) -> Client {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve_connection(host.clone(), server));
        let (reader, writer) = tokio::io::split(client);
        Client {
            reader: BufReader::new(reader),
            writer,
            server,
        }
    }

    async fn send(&mut self, envelope: WireEnvelope) {
        write_envelope(&mut self.writer, &envelope).await.unwrap();
    }

    async fn recv(&mut self) -> WireEnvelope {
        timeout(Duration::from_secs(5), read_envelope(&mut self.reader))
            .await
            .expect("timed out waiting for the service")
            .unwrap()
            .expect("service closed the connection")
    }

    async fn hello(&mut self) -> u64 {
        self.send(WireEnvelope::Hello(Hello {
            protocol_version: PROTOCOL_VERSION,
            origin: Some("ipc-test".into()),
        }))
        .await;
        match self.recv().await {
            WireEnvelope::Welcome(welcome) => {
                assert!(welcome.members.iter().any(|m| m == "crypto.subtle.sign"));
                welcome.caller_id.raw()
            }
            other => panic!("expected Welcome, got {other:?}"),
        }
    }

    async fn call(&mut self, id: u64, member: &str, args: Vec<Value>) {
        self.send(WireEnvelope::Call(Call {
            id,
            member: member.into(),
            args,
        }))
        .await;
    }

    /// Outcomes arrive in completion order; collect `n` of them by id.
    async fn outcomes(&mut self, n: usize) -> HashMap<u64, OutcomeStatus> {
        let mut seen = HashMap::new();
        while seen.len() < n {
            match self.recv().await {
                WireEnvelope::Outcome(outcome) => {
                    seen.insert(outcome.id, outcome.status);
                }
                other => panic!("expected Outcome, got {other:?}"),
            }
        }
        seen
    }

    async fn close(mut self) -> anyhow::Result<()> {
        self.writer.shutdown().await.unwrap();
        timeout(Duration::from_secs(5), self.server)
            .await
            .expect("server did not finish")
            .unwrap()
    }
}

fn host() -> Arc<GatewayHost> {
    Arc::new(GatewayHost::from_settings(&GatewaySettings::default()).unwrap())
}

fn ok_value(status: &OutcomeStatus) -> &Value {
    match status {
        OutcomeStatus::Ok { value } => value,
        other => panic!("expected ok, got {other:?}"),
    }
}

fn err_kind(status: &OutcomeStatus) -> &str {
    match status {
        OutcomeStatus::Err { kind, .. } => kind,
        other => panic!("expected err, got {other:?}"),
    }
}

#[tokio::test]
async fn full_session_over_duplex_stream() {
    let host = host();
    let mut client = Client::connect(&host);
    client.hello().await;
    assert_eq!(host.active_sessions(), 1);

    client
        .call(1, "cryptokeys.getKeyByName", vec![json!("token-slot-1")])
        .await;
    let outcomes = client.outcomes(1).await;
    let key = ok_value(&outcomes[&1]).clone();
    assert_eq!(key["name"], json!("token-slot-1"));
    assert_eq!(key["extractable"], json!(false));

    client
        .call(2, "crypto.subtle.sign", vec![json!({ "name": "Ed25519" }), key.clone(), json!("msg")])
        .await;
    client.call(3, "crypto.subtle.exportKey", vec![json!("raw"), key]).await;
    client.call(4, "crypto.subtle.encrypt", vec![]).await;
    client
        .call(5, "crypto.subtle.decrypt", vec![Value::Null, json!({ "cs_pkcs11id": "soft:0" }), json!([1])])
        .await;
    client.call(6, "digest", vec![json!("abc")]).await;

    let outcomes = client.outcomes(5).await;
    assert_eq!(ok_value(&outcomes[&2]).as_array().unwrap().len(), 64);
    assert_eq!(ok_value(&outcomes[&3]).as_array().unwrap().len(), 32);
    assert_eq!(err_kind(&outcomes[&4]), "UnknownMember");
    assert_eq!(err_kind(&outcomes[&5]), "MissingAlgorithmName");
    assert_eq!(
        ok_value(&outcomes[&6]),
        &json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
    );

    client.close().await.unwrap();
    assert_eq!(host.active_sessions(), 0);
}

#[tokio::test]
async fn protocol_mismatch_is_refused() {
    let host = host();
    let mut client = Client::connect(&host);
    client
        .send(WireEnvelope::Hello(Hello {
            protocol_version: PROTOCOL_VERSION + 1,
            origin: None,
        }))
        .await;
    match client.recv().await {
        WireEnvelope::Error { message } => assert!(message.contains("protocol")),
        other => panic!("expected Error, got {other:?}"),
    }
    assert!(client.close().await.is_err());
    assert_eq!(host.active_sessions(), 0);
}

#[tokio::test]
async fn malformed_lines_do_not_end_the_session() {
    let host = host();
    let mut client = Client::connect(&host);
    client.hello().await;

    client.writer.write_all(b"{not json}\n").await.unwrap();
    match client.recv().await {
        WireEnvelope::Error { message } => assert!(message.starts_with("malformed envelope")),
        other => panic!("expected Error, got {other:?}"),
    }

    client.call(1, "digest", vec![json!("")]).await;
    let outcomes = client.outcomes(1).await;
    assert!(ok_value(&outcomes[&1]).is_string());
    client.close().await.unwrap();
}

#[tokio::test]
async fn disconnect_tears_down_only_that_caller() {
    let host = host();
    let mut a = Client::connect(&host);
    let mut b = Client::connect(&host);
    let id_a = a.hello().await;
    let id_b = b.hello().await;
    assert_ne!(id_a, id_b);
    assert_eq!(host.active_sessions(), 2);

    a.close().await.unwrap();
    assert_eq!(host.active_sessions(), 1);

    b.call(1, "cryptokeys.getKeyByName", vec![Value::Null]).await;
    let outcomes = b.outcomes(1).await;
    assert_eq!(ok_value(&outcomes[&1])["name"], json!("token-slot-1"));
    b.close().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn serves_callers_over_a_unix_socket() {
    use gateway_service::ipc::IpcServer;
    use tokio::net::UnixStream;

    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("run").join("gateway.ipc");
    let host = host();
    let server = Arc::new(IpcServer::new(host.clone(), socket.clone()));
    let task = tokio::spawn(server.start());

    let mut stream = None;
    for _ in 0..100 {
        match UnixStream::connect(&socket).await {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    let (reader, mut writer) = tokio::io::split(stream.expect("socket never came up"));
    let mut reader = BufReader::new(reader);

    write_envelope(
        &mut writer,
        &WireEnvelope::Hello(Hello {
            protocol_version: PROTOCOL_VERSION,
            origin: None,
        }),
    )
    .await
    .unwrap();
    match read_envelope(&mut reader).await.unwrap() {
        Some(WireEnvelope::Welcome(welcome)) => assert_eq!(welcome.members.len(), 5),
        other => panic!("expected Welcome, got {other:?}"),
    }
    assert_eq!(host.active_sessions(), 1);
    task.abort();
}
