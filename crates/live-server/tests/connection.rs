// crates/live-server/tests/connection.rs
use std::sync::Arc;
use std::time::Duration;

use live_core::Patch;
use live_protocol::{ErrorEvent, Event};
use live_server::client::run_connection;
use live_server::{shutdown, Engine, EngineConfig, Handler, LiveError, SessionId, Shutdown};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Counter {
    value: i64,
}

fn engine(config: EngineConfig) -> Arc<Engine<Counter>> {
    let handler = Handler::<Counter>::new()
        .with_render(|ctx| Ok(format!("<main><h1>{}</h1></main>", ctx.assigns.value)))
        .handle_event("inc", |_socket, c, _p| Ok(Counter { value: c.value + 1 }))
        .handle_event("boom", |_socket, _c, _p| Err(anyhow::anyhow!("kaboom")))
        .handle_event("crash", |_socket, _c, _p| panic!("handler crashed"));
    Engine::new(handler, config, Shutdown::never())
}

struct Client {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl Client {
    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn recv(&mut self) -> Event {
        let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("frame in time")
            .unwrap()
            .expect("stream open");
        serde_json::from_str(&line).unwrap()
    }
}

fn connect(
    engine: &Arc<Engine<Counter>>,
    shutdown: Shutdown,
) -> (Client, JoinHandle<Result<(), LiveError>>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(run_connection(engine.clone(), server, shutdown));
    let (read, writer) = tokio::io::split(client);
    let client = Client {
        lines: BufReader::new(read).lines(),
        writer,
    };
    (client, task)
}

async fn handshake(client: &mut Client, session: &str) {
    client
        .send(&json!({ "t": "connect", "d": { "session": session } }).to_string())
        .await;
    assert_eq!(client.recv().await.kind, "connect");
    let first = client.recv().await;
    assert_eq!(first.kind, "patch");
    assert!(first.patches().unwrap()[0].is_root());
}

#[tokio::test]
async fn connect_then_events_are_patched_and_acked() {
    let engine = engine(EngineConfig::default());
    let (mut client, task) = connect(&engine, Shutdown::never());
    handshake(&mut client, "s1").await;
    assert_eq!(engine.connection_count().await, 1);

    client.send(r#"{"t":"inc","i":1}"#).await;
    let patch = client.recv().await;
    assert_eq!(
        patch.patches().unwrap(),
        vec![Patch::new(vec![1, 0, 0], r#"<h1 _l_1_0_0="">1</h1>"#)]
    );
    let ack = client.recv().await;
    assert_eq!(ack.kind, "ack");
    assert_eq!(ack.id, Some(1));

    drop(client);
    task.await.unwrap().unwrap();
    assert_eq!(engine.connection_count().await, 0);
}

#[tokio::test]
async fn unknown_event_is_only_acked() {
    let engine = engine(EngineConfig::default());
    let (mut client, _task) = connect(&engine, Shutdown::never());
    handshake(&mut client, "s1").await;

    client.send(r#"{"t":"nobody-handles-this","i":7}"#).await;
    let ack = client.recv().await;
    assert_eq!(ack.kind, "ack");
    assert_eq!(ack.id, Some(7));
}

#[tokio::test]
async fn handler_errors_come_back_as_err_events() {
    let engine = engine(EngineConfig::default());
    let (mut client, _task) = connect(&engine, Shutdown::never());
    handshake(&mut client, "s1").await;

    client.send(r#"{"t":"inc","i":2,"d":[1]}"#).await;
    let err = client.recv().await;
    assert_eq!(err.kind, "err");
    let body: ErrorEvent = serde_json::from_value(err.data.unwrap()).unwrap();
    assert_eq!(body.source.kind, "inc");
    assert!(body.err.contains("malformed params"), "{}", body.err);
    assert_eq!(client.recv().await.id, Some(2));

    client.send(r#"{"t":"boom","i":3}"#).await;
    let err = client.recv().await;
    assert_eq!(err.kind, "err");
    assert_eq!(client.recv().await.id, Some(3));

    // Still serving.
    client.send(r#"{"t":"inc","i":4}"#).await;
    assert_eq!(client.recv().await.kind, "patch");
}

#[tokio::test]
async fn undecodable_frames_are_skipped() {
    let engine = engine(EngineConfig::default());
    let (mut client, _task) = connect(&engine, Shutdown::never());
    handshake(&mut client, "s1").await;

    client.send("this is not json").await;
    client.send(r#"{"t":"inc","i":5}"#).await;
    assert_eq!(client.recv().await.kind, "patch");
    assert_eq!(client.recv().await.id, Some(5));
}

#[tokio::test]
async fn oversized_frame_ends_the_connection() {
    let config = EngineConfig {
        max_message_size: 64,
        ..EngineConfig::default()
    };
    let engine = engine(config);
    let (mut client, task) = connect(&engine, Shutdown::never());
    handshake(&mut client, "s1").await;

    let padding = "x".repeat(200);
    client
        .send(&json!({ "t": "inc", "d": { "pad": padding } }).to_string())
        .await;

    let result = task.await.unwrap();
    assert!(matches!(result, Err(LiveError::Protocol(_))));
    assert_eq!(engine.connection_count().await, 0);
}

#[tokio::test]
async fn panicking_event_handler_unmounts_the_socket() {
    let engine = engine(EngineConfig::default());
    let (mut client, task) = connect(&engine, Shutdown::never());
    handshake(&mut client, "s1").await;
    assert_eq!(engine.connection_count().await, 1);

    client.send(r#"{"t":"crash","i":1}"#).await;

    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("connection ended")
        .unwrap();
    assert!(matches!(result, Err(LiveError::HandlerPanic)));
    assert_eq!(engine.connection_count().await, 0);
    assert!(engine.get_socket_by_session(&SessionId::new("s1")).await.is_none());
}

#[tokio::test]
async fn negative_ids_are_acked() {
    let engine = engine(EngineConfig::default());
    let (mut client, _task) = connect(&engine, Shutdown::never());
    handshake(&mut client, "s1").await;

    client.send(r#"{"t":"nobody-handles-this","i":-4}"#).await;
    let ack = client.recv().await;
    assert_eq!(ack.kind, "ack");
    assert_eq!(ack.id, Some(-4));
}

#[tokio::test]
async fn first_frame_must_be_connect() {
    let engine = engine(EngineConfig::default());
    let (mut client, task) = connect(&engine, Shutdown::never());
    client.send(r#"{"t":"inc"}"#).await;

    let result = task.await.unwrap();
    assert!(matches!(result, Err(LiveError::Protocol(_))));
    assert_eq!(engine.connection_count().await, 0);
}

#[tokio::test]
async fn empty_session_gets_a_generated_one() {
    let engine = engine(EngineConfig::default());
    let (mut client, _task) = connect(&engine, Shutdown::never());
    handshake(&mut client, "").await;

    assert_eq!(engine.connection_count().await, 1);
    assert!(engine.get_socket_by_session(&SessionId::new("")).await.is_none());
}

#[tokio::test]
async fn shutdown_closes_live_connections() {
    let engine = engine(EngineConfig::default());
    let (trigger, signal) = shutdown::channel();
    let (mut client, task) = connect(&engine, signal);
    handshake(&mut client, "s1").await;

    trigger.trigger();
    task.await.unwrap().unwrap();
    assert_eq!(engine.connection_count().await, 0);
}
