//! End-to-end tests over a real WebSocket connection.
//!
//! These drive the gateway exactly like a browser client would: JSON text
//! frames on a loopback socket. The SSH side points at addresses that
//! refuse, which exercises the protocol surface without a live server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use termgate::protocol::{ClientEvent, ServerEvent};
use termgate::provider::russh::RusshProvider;
use termgate::{ConnectionConfig, Gateway, GatewayConfig};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_gateway() -> SocketAddr {
    let config = GatewayConfig {
        listen: "127.0.0.1:0".into(),
        connect_timeout_secs: 5,
        challenge_timeout_secs: 5,
        teardown_timeout_secs: 1,
        max_sessions: 4,
    };
    let provider = Arc::new(RusshProvider::new());
    let gateway = Gateway::bind(&config, provider)
        .await
        .expect("failed to bind gateway");
    let addr = gateway.local_addr();
    tokio::spawn(gateway.run());
    addr
}

async fn client(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}"))
        .await
        .expect("failed to connect to gateway");
    ws
}

async fn send_event(ws: &mut Client, event: &ClientEvent) {
    let json = serde_json::to_string(event).expect("failed to encode event");
    ws.send(Message::Text(json.into()))
        .await
        .expect("failed to send frame");
}

async fn next_server_event(ws: &mut Client) -> ServerEvent {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for server event")
            .expect("connection closed")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("unparseable server event");
        }
    }
}

fn refused_config() -> ConnectionConfig {
    // Port 1 on loopback refuses immediately on any sane test host.
    ConnectionConfig {
        host: "127.0.0.1".into(),
        port: 1,
        username: "nobody".into(),
        password: Some("x".into()),
        private_key: None,
        passphrase: None,
    }
}

#[tokio::test]
async fn test_input_without_session_answers_no_route() {
    let addr = start_gateway().await;
    let mut ws = client(addr).await;

    send_event(&mut ws, &ClientEvent::ShellInput("ls\n".into())).await;
    assert!(matches!(next_server_event(&mut ws).await, ServerEvent::NoRoute));
}

#[tokio::test]
async fn test_malformed_frame_is_dropped_and_connection_survives() {
    let addr = start_gateway().await;
    let mut ws = client(addr).await;

    ws.send(Message::Text("this is not json".into()))
        .await
        .expect("failed to send frame");
    ws.send(Message::Text(r#"{"event":"no-such-event"}"#.into()))
        .await
        .expect("failed to send frame");

    // The connection is still open and still answers.
    send_event(&mut ws, &ClientEvent::ShellInput("ls\n".into())).await;
    assert!(matches!(next_server_event(&mut ws).await, ServerEvent::NoRoute));
}

#[tokio::test]
async fn test_binary_frame_is_ignored() {
    let addr = start_gateway().await;
    let mut ws = client(addr).await;

    ws.send(Message::Binary(vec![0x01, 0x02, 0x03].into()))
        .await
        .expect("failed to send frame");

    send_event(&mut ws, &ClientEvent::ShellInput("ls\n".into())).await;
    assert!(matches!(next_server_event(&mut ws).await, ServerEvent::NoRoute));
}

#[tokio::test]
async fn test_refused_connect_reports_session_error() {
    let addr = start_gateway().await;
    let mut ws = client(addr).await;

    send_event(&mut ws, &ClientEvent::Connect(refused_config())).await;
    match next_server_event(&mut ws).await {
        ServerEvent::SessionError { reason } => {
            assert!(!reason.is_empty(), "error must carry a reason")
        }
        other => panic!("expected session-error, got {other:?}"),
    }

    // A failed session leaves the connection usable for another try.
    send_event(&mut ws, &ClientEvent::Connect(refused_config())).await;
    match next_server_event(&mut ws).await {
        ServerEvent::SessionError { reason } => {
            assert!(!reason.is_empty(), "error must carry a reason")
        }
        other => panic!("expected session-error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_config_rejected_over_wire() {
    let addr = start_gateway().await;
    let mut ws = client(addr).await;

    let config = ConnectionConfig {
        host: String::new(),
        port: 22,
        username: "nobody".into(),
        password: Some("x".into()),
        private_key: None,
        passphrase: None,
    };
    send_event(&mut ws, &ClientEvent::Connect(config)).await;
    match next_server_event(&mut ws).await {
        ServerEvent::SessionError { reason } => {
            assert!(reason.contains("host"), "unexpected reason: {reason}")
        }
        other => panic!("expected session-error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disconnect_without_session_is_quiet() {
    let addr = start_gateway().await;
    let mut ws = client(addr).await;

    send_event(&mut ws, &ClientEvent::Disconnect).await;

    // No terminal event fires; the next routable event still answers.
    send_event(&mut ws, &ClientEvent::ShellInput("ls\n".into())).await;
    assert!(matches!(next_server_event(&mut ws).await, ServerEvent::NoRoute));
}
