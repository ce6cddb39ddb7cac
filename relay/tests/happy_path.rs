//! End-to-end scenarios from the relay's testable properties (spec §8): a
//! real `axum::serve` instance plus a raw `tokio-tungstenite` client
//! standing in for a tunnel client, and a raw `TcpStream` standing in for
//! a public caller.

use futures_util::{SinkExt, StreamExt};
use rtunnel_relay::config::Config;
use rtunnel_relay::{router, RelayState};
use rtunnel_shared::protocol::{ControlMessage, StreamFrame, StreamOp};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

async fn spawn_relay() -> std::net::SocketAddr {
    let config = Config {
        hostname: "127.0.0.1".into(),
        port: 0,
        subdomain: String::new(),
        log_level: "error".into(),
    };
    let app = router(RelayState::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Issues a bare HTTP/1.1 GET and returns (status, body).
async fn raw_get(addr: std::net::SocketAddr, path: &str, host: &str) -> (u16, String) {
    let mut sock = tokio::net::TcpStream::connect(addr).await.unwrap();
    let req = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    sock.write_all(req.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    sock.read_to_end(&mut buf).await.unwrap();
    let text = String::from_utf8_lossy(&buf).into_owned();
    let status = text
        .split("\r\n")
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let body = text.split("\r\n\r\n").nth(1).unwrap_or("").to_string();
    (status, body)
}

#[tokio::test]
async fn happy_path_round_trips_the_response() {
    let addr = spawn_relay().await;
    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/tunnel"))
        .await
        .unwrap();

    let create = serde_json::to_string(&ControlMessage::CreateTunnel {
        name: "alice".into(),
    })
    .unwrap();
    client.send(Message::Text(create.into())).await.unwrap();

    let public = tokio::spawn(async move { raw_get(addr, "/foo", "alice.example.com").await });

    // Wait for the incomingClient event naming this request's ticket.
    let ticket = loop {
        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => match serde_json::from_str(&text).unwrap() {
                ControlMessage::IncomingClient { ticket } => break ticket,
                ControlMessage::CreateTunnel { .. } => continue,
            },
            _ => continue,
        }
    };

    // Open the stream (first frame tagged with the ticket fulfills the
    // server's pending acceptor), then read the serialized request.
    client
        .send(Message::Binary(
            StreamFrame::data(ticket, Vec::new()).encode().into(),
        ))
        .await
        .unwrap();

    let mut request_bytes = Vec::new();
    loop {
        match client.next().await.unwrap().unwrap() {
            Message::Binary(data) => {
                let frame = StreamFrame::decode(&data).unwrap();
                assert_eq!(frame.ticket, ticket);
                match frame.op {
                    StreamOp::Data => request_bytes.extend_from_slice(&frame.payload),
                    StreamOp::Eof => break,
                    StreamOp::Reset => panic!("unexpected reset"),
                }
            }
            _ => continue,
        }
    }

    let request_text = String::from_utf8(request_bytes).unwrap();
    assert!(request_text.starts_with("GET /foo HTTP/1.1\r\n"));
    assert!(request_text.to_ascii_lowercase().contains("host: alice.example.com\r\n"));

    client
        .send(Message::Binary(
            StreamFrame::data(ticket, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi".to_vec())
                .encode()
                .into(),
        ))
        .await
        .unwrap();
    client
        .send(Message::Binary(StreamFrame::eof(ticket).encode().into()))
        .await
        .unwrap();

    let (status, body) = public.await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "hi");
}

#[tokio::test]
async fn unknown_subdomain_yields_502_with_the_expected_body() {
    let addr = spawn_relay().await;
    let (status, body) = raw_get(addr, "/", "ghost.example.com").await;
    assert_eq!(status, 502);
    assert_eq!(body, "ghost is currently unregistered or offline.");
}

#[tokio::test]
async fn name_collision_disconnects_the_second_client() {
    let addr = spawn_relay().await;
    let (mut a, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/tunnel"))
        .await
        .unwrap();
    let (mut b, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/tunnel"))
        .await
        .unwrap();

    a.send(Message::Text(
        serde_json::to_string(&ControlMessage::CreateTunnel { name: "bob".into() })
            .unwrap()
            .into(),
    ))
    .await
    .unwrap();
    // Give a's claim time to land before b races for the same name.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    b.send(Message::Text(
        serde_json::to_string(&ControlMessage::CreateTunnel { name: "BOB".into() })
            .unwrap()
            .into(),
    ))
    .await
    .unwrap();

    // Give the server a moment to process both messages and disconnect b.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(matches!(b.next().await, None | Some(Err(_))));

    // Only a's claim survived; /health reports exactly one active tunnel.
    let (status, health) = raw_get(addr, "/health", "example.com").await;
    assert_eq!(status, 200);
    assert!(health.contains("\"active_tunnels\":1"));
}
