pub mod common;

use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use serde_json::Value;
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn ws_url(server: &common::Server, token: &str) -> String {
    let base = server.base_url.replacen("http", "ws", 1);
    format!("{base}/ws?token={token}")
}

/// Opens the notification stream and waits until it is registered.
async fn connect(server: &common::Server, client: &common::Client) -> Socket {
    let token = client.auth_token.as_deref().expect("not signed in");
    let (mut socket, _) = connect_async(ws_url(server, token))
        .await
        .expect("failed to connect");
    ping(&mut socket).await;
    socket
}

async fn next(socket: &mut Socket) -> Option<Message> {
    timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out waiting for a frame")
        .map(|frame| frame.expect("websocket error"))
}

/// Sends `ping` and fails on any event received before the `pong`.
async fn ping(socket: &mut Socket) {
    socket
        .send(Message::Text("ping".into()))
        .await
        .expect("failed to send ping");
    match next(socket).await {
        Some(Message::Text(text)) => assert_eq!(text, "pong"),
        other => panic!("expected pong, got {other:?}"),
    }
}

async fn next_event(socket: &mut Socket) -> Value {
    match next(socket).await {
        Some(Message::Text(text)) => {
            serde_json::from_str(&text).expect("invalid event")
        }
        other => panic!("expected an event, got {other:?}"),
    }
}

#[tokio::test]
async fn rejects_missing_or_invalid_token() {
    let server = common::Server::start().await;

    match connect_async(ws_url(&server, "garbage")).await {
        Err(tungstenite::Error::Http(resp)) => {
            assert_eq!(resp.status().as_u16(), 401);
        }
        Err(e) => panic!("expected 401, got {e}"),
        Ok(_) => panic!("connected with an invalid token"),
    }

    let url = server.base_url.replacen("http", "ws", 1) + "/ws";
    assert!(connect_async(url).await.is_err());
}

#[tokio::test]
async fn answers_ping_with_pong() {
    let server = common::Server::start().await;
    let alice = server.login("alice@example.com").await;

    let mut socket = connect(&server, &alice).await;
    ping(&mut socket).await;
}

#[tokio::test]
async fn new_connection_replaces_old_one() {
    let server = common::Server::start().await;
    let alice = server.login("alice@example.com").await;

    let mut first = connect(&server, &alice).await;
    let mut second = connect(&server, &alice).await;

    assert!(matches!(next(&mut first).await, Some(Message::Close(_))));

    let ticket = alice.add_ticket("Leaking tap").await.unwrap();
    let event = next_event(&mut second).await;
    assert_eq!(event["kind"], "created");
    assert_eq!(event["ticket"]["id"], ticket.id.to_string());
    assert_eq!(event["ticket"]["title"], "Leaking tap");
}

#[tokio::test]
async fn ticket_events_skip_unrelated_customers() {
    let server = common::Server::start().await;
    let alice = server.login("alice@example.com").await;
    let carol = server.login("carol@example.com").await;
    let dave = server.login("dave@example.com").await;

    let mut admin = connect(&server, &carol).await;
    let mut stranger = connect(&server, &dave).await;

    alice.add_ticket("Leaking tap").await.unwrap();

    assert_eq!(next_event(&mut admin).await["kind"], "created");
    ping(&mut stranger).await;
    assert!(
        timeout(Duration::from_millis(200), stranger.next())
            .await
            .is_err(),
        "unrelated customer received an event",
    );
}

#[tokio::test]
async fn deactivation_closes_stream() {
    let server = common::Server::start().await;
    let carol = server.login("carol@example.com").await;
    let dave = server.login("dave@example.com").await;

    let mut socket = connect(&server, &dave).await;
    carol.toggle_user(common::id(4)).await.unwrap();

    assert!(matches!(next(&mut socket).await, Some(Message::Close(_))));
}
