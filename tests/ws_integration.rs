//! Websocket end-to-end tests: a real listener, real upgrade handshakes,
//! and the production client.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use syncroom::{
    DiskDocumentProvider, DocumentCallbacks, Hub, Message, Reader, RoomName, ServerConfig,
    SubEntry, SyncClient, SyncServer, WriterConfig,
};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Start a server on a free port; returns the hub and the `ws://…/ws` base
/// URL.
async fn start_server(dir: &std::path::Path) -> (Arc<Hub>, String) {
    let provider =
        DiskDocumentProvider::new(WriterConfig::for_testing(dir), DocumentCallbacks::empty())
            .expect("data dir");
    let hub = Arc::new(Hub::new(Arc::new(provider)));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = SyncServer::new(ServerConfig::default(), hub.clone());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (hub, format!("ws://{addr}/ws"))
}

/// Past the test coalescing delay plus scheduling noise.
async fn flushed() {
    sleep(Duration::from_millis(250)).await;
}

#[tokio::test]
async fn test_subscription_echo_confirms_request() {
    let dir = tempfile::tempdir().unwrap();
    let (_hub, url) = start_server(dir.path()).await;

    let room = RoomName::from("doc");
    let mut client = SyncClient::new(format!("{url}/doc"));
    client.connect().await.unwrap();

    client
        .subscribe(vec![SubEntry {
            room: room.clone(),
            offset: 0,
            room_session_id: 1,
        }])
        .await
        .unwrap();

    timeout(Duration::from_secs(2), client.wait_for_confs())
        .await
        .expect("subscription should be echoed");
    assert_eq!(client.unconfirmed_count(), 0);

    client.disconnect().await;
}

#[tokio::test]
async fn test_history_replays_to_reconnecting_client() {
    let dir = tempfile::tempdir().unwrap();
    let (_hub, url) = start_server(dir.path()).await;
    let room = RoomName::from("doc");

    // First client writes an update, waits for the flush, leaves.
    let mut alice = SyncClient::new(format!("{url}/doc"));
    alice.connect().await.unwrap();
    alice.update_room(&room, &[1, 2, 3]).await.unwrap();
    flushed().await;
    alice.disconnect().await;
    sleep(Duration::from_millis(50)).await;

    assert_eq!(std::fs::read(dir.path().join("doc")).unwrap(), vec![3, 1, 2, 3]);

    // A fresh client on the same room gets the log replayed before
    // anything else.
    let mut bob = SyncClient::new(format!("{url}/doc"));
    bob.connect().await.unwrap();
    flushed().await;

    assert_eq!(bob.room_data(&room), vec![1, 2, 3]);
    bob.disconnect().await;
}

#[tokio::test]
async fn test_connection_churn_promotes_survivor_then_removes_session() {
    let dir = tempfile::tempdir().unwrap();
    let (hub, url) = start_server(dir.path()).await;
    let room = RoomName::from("churn");

    let mut first = SyncClient::new(format!("{url}/churn"));
    first.connect().await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let session = hub.session_for_room(&room, None);
    let session_id = session.id();
    assert_eq!(session.connection_count(), 1);

    // A second connection joins the same room, hence the same session.
    let mut second = SyncClient::new(format!("{url}/churn"));
    second.connect().await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(session.connection_count(), 2);

    // The active connection closes; the survivor is promoted.
    first.disconnect().await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(session.connection_count(), 1);
    assert!(session.has_active_conn());

    // Outbound traffic now reaches the surviving connection.
    let origin = hub.create_session(&room, None);
    hub.update_room(&room, &origin, &[9], None).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(second.room_data(&room), vec![9]);

    // When the survivor closes too, the session is destroyed.
    second.disconnect().await;
    sleep(Duration::from_millis(100)).await;
    assert!(hub.get_session(session_id).is_none());
}

#[tokio::test]
async fn test_unknown_message_kind_keeps_socket_open() {
    let dir = tempfile::tempdir().unwrap();
    let (_hub, url) = start_server(dir.path()).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}/raw"))
        .await
        .unwrap();

    // Leading varint 99: the server logs and skips the frame.
    ws.send(WsMessage::Binary(vec![99, 1, 2, 3].into()))
        .await
        .unwrap();

    // The connection is still usable: a valid subscription gets its echo.
    let awareness = Message::Awareness {
        confirmation: 7,
        subs: vec![SubEntry {
            room: RoomName::from("raw"),
            offset: 0,
            room_session_id: 0,
        }],
        client_state: String::new(),
    };
    ws.send(WsMessage::Binary(awareness.encode().into()))
        .await
        .unwrap();

    let echoed = timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Binary(data))) => {
                    let mut r = Reader::new(&data);
                    break Message::decode(&mut r).unwrap();
                }
                Some(Ok(_)) => continue,
                other => panic!("connection dropped: {other:?}"),
            }
        }
    })
    .await
    .expect("echo should arrive on the same socket");

    match echoed {
        Message::Awareness { confirmation, .. } => assert_eq!(confirmation, 7),
        other => panic!("expected awareness echo, got {other:?}"),
    }

    let _ = ws.send(WsMessage::Close(None)).await;
}
