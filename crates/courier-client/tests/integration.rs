//! Integration tests for the Courier client
//!
//! These run the client against small in-process relays listening on
//! loopback TCP.

use courier_client::layout::Folder;
use courier_client::{Client, ClientEvent, ClientOptions, EventReceiver};
use courier_core::{
    AesGcmCipher, ErrorKind, FrameReader, Framing, KdfParams, KeyLength, PeerId, SessionState,
    TcpDialer, TransferStatus,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

const WAIT: Duration = Duration::from_secs(10);

fn light_kdf() -> KdfParams {
    KdfParams {
        m_cost_kib: 64,
        t_cost: 1,
        p_cost: 1,
    }
}

fn client_for(addr: SocketAddr, data_dir: &Path, user: &str, framing: Framing) -> (Client, EventReceiver) {
    let options = ClientOptions {
        username: PeerId::parse(user).unwrap(),
        data_dir: data_dir.to_path_buf(),
        framing,
        io_timeout: Some(WAIT),
    };
    let dialer = TcpDialer::new(addr.to_string(), Some(WAIT));
    Client::new(options, dialer, AesGcmCipher::new(light_kdf()))
}

async fn next_matching<F>(events: &mut EventReceiver, mut pred: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

/// A relay that logs clients in, answers directory queries and forwards
/// submissions to the recipient's persistent connection.
struct FakeRelay {
    addr: SocketAddr,
    sessions: Arc<Mutex<HashMap<String, OwnedWriteHalf>>>,
}

impl FakeRelay {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sessions = Arc::new(Mutex::new(HashMap::new()));

        let shared = Arc::clone(&sessions);
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(serve(stream, Arc::clone(&shared)));
            }
        });

        Self { addr, sessions }
    }

    async fn wait_for_login(&self, user: &str) {
        tokio::time::timeout(WAIT, async {
            while !self.sessions.lock().await.contains_key(user) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("user never logged in");
    }
}

async fn serve(stream: TcpStream, sessions: Arc<Mutex<HashMap<String, OwnedWriteHalf>>>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let Ok(Some(first)) = reader.read_line().await else {
        return;
    };

    if let Some(user) = first.strip_prefix("LOGIN:") {
        let user = user.to_string();
        write_half
            .write_all(format!("Welcome {}\n", user).as_bytes())
            .await
            .unwrap();
        sessions.lock().await.insert(user.clone(), write_half);
        while let Ok(Some(_)) = reader.read_line().await {}
        sessions.lock().await.remove(&user);
    } else if first == "LIST_CLIENTS" {
        let names: Vec<String> = sessions.lock().await.keys().cloned().collect();
        let response = format!("{}\n", names.join(","));
        write_half.write_all(response.as_bytes()).await.unwrap();
    } else if first == "START_FILE" {
        let recipient = reader.read_line().await.unwrap().unwrap();
        let name = reader.read_line().await.unwrap().unwrap();
        let size: usize = reader.read_line().await.unwrap().unwrap().parse().unwrap();
        let payload = reader.read_exact(size).await.unwrap();

        let ack = match sessions.lock().await.get_mut(&recipient) {
            Some(target) => {
                let mut frame = format!("FILE:{}\n{}\n", name, size).into_bytes();
                frame.extend_from_slice(&payload);
                target.write_all(&frame).await.unwrap();
                format!("File '{}' delivered to {}", name, recipient)
            }
            None => format!("{} is offline", recipient),
        };
        write_half.write_all(format!("{}\n", ack).as_bytes()).await.unwrap();
    }
}

/// Accept one connection, consume the login line and hand back the socket
async fn accept_login(listener: &TcpListener) -> TcpStream {
    let (stream, _) = listener.accept().await.unwrap();
    let mut reader = FrameReader::new(stream);
    let login = reader.read_line().await.unwrap().unwrap();
    assert!(login.starts_with("LOGIN:"));
    let (stream, leftover) = reader.into_parts();
    assert!(leftover.is_empty());
    stream
}

#[tokio::test]
async fn test_demultiplex_logs_and_file() {
    let dir = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let payload: Vec<u8> = (0..128u8).map(|b| b.wrapping_mul(37)).collect();

    let wire = payload.clone();
    let relay = tokio::spawn(async move {
        let mut stream = accept_login(&listener).await;
        let mut frame = b"one\ntwo\nthree\nFILE:report.txt\n128\n".to_vec();
        frame.extend_from_slice(&wire);
        stream.write_all(&frame).await.unwrap();
        // Hold the connection open until the test is done
        tokio::time::sleep(WAIT).await;
    });

    let (mut client, mut events) = client_for(addr, dir.path(), "alice", Framing::Lines);
    client.connect().await.unwrap();

    let mut logs = Vec::new();
    let completed = next_matching(&mut events, |event| {
        if let ClientEvent::Log(line) = event {
            logs.push(line.clone());
        }
        matches!(event, ClientEvent::TransferCompleted { .. })
    })
    .await;

    assert_eq!(logs, vec!["one", "two", "three"]);
    let ClientEvent::TransferCompleted { transfer, path } = completed else {
        unreachable!()
    };
    assert_eq!(transfer.file_name, "report.txt");
    assert_eq!(transfer.declared_size, 128);
    assert_eq!(transfer.status(), TransferStatus::Completed);
    assert_eq!(path, client.dirs().received().join("report.txt"));
    assert_eq!(std::fs::read(&path).unwrap(), payload);
    assert_eq!(client.state(), SessionState::Authenticated);

    client.disconnect().await;
    assert_eq!(client.state(), SessionState::Disconnected);
    relay.abort();
}

#[tokio::test]
async fn test_connection_drop_mid_transfer() {
    let dir = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut stream = accept_login(&listener).await;
        let mut frame = b"FILE:big.bin\n1000\n".to_vec();
        frame.extend_from_slice(&[9u8; 400]);
        stream.write_all(&frame).await.unwrap();
        stream.shutdown().await.unwrap();
    });

    let (mut client, mut events) = client_for(addr, dir.path(), "alice", Framing::Lines);
    client.connect().await.unwrap();

    let failed = next_matching(&mut events, |e| matches!(e, ClientEvent::TransferFailed { .. })).await;
    let ClientEvent::TransferFailed { transfer, .. } = failed else {
        unreachable!()
    };
    assert_eq!(transfer.status(), TransferStatus::Failed);

    let disconnected =
        next_matching(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
    assert!(matches!(disconnected, ClientEvent::Disconnected { reason: Some(_) }));

    client.wait_closed().await;
    assert_eq!(client.state(), SessionState::Closed);
    assert!(!client.dirs().received().join("big.bin").exists());
}

#[tokio::test]
async fn test_peer_list_empty_vs_refused() {
    let dir = TempDir::new().unwrap();
    let relay = FakeRelay::start().await;

    let (mut alice, _alice_events) = client_for(relay.addr, dir.path(), "alice", Framing::Lines);
    alice.connect().await.unwrap();
    relay.wait_for_login("alice").await;

    let peers = alice.list_peers().await.unwrap();
    assert!(peers.is_empty());

    let (mut bob, _bob_events) = client_for(relay.addr, dir.path(), "bob", Framing::Lines);
    bob.connect().await.unwrap();
    relay.wait_for_login("bob").await;
    let peers = alice.list_peers().await.unwrap();
    assert_eq!(peers.into_iter().collect::<Vec<_>>(), vec![PeerId::parse("bob").unwrap()]);

    // Nothing listening on this port any more
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = closed.local_addr().unwrap();
    drop(closed);
    let (nobody, _events) = client_for(dead_addr, dir.path(), "carol", Framing::Lines);
    let err = nobody.list_peers().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
}

#[tokio::test]
async fn test_concurrent_submissions() {
    let dir = TempDir::new().unwrap();
    let relay = FakeRelay::start().await;

    let (mut bob, mut bob_events) = client_for(relay.addr, dir.path(), "bob", Framing::Lines);
    let (mut carol, mut carol_events) = client_for(relay.addr, dir.path(), "carol", Framing::Lines);
    bob.connect().await.unwrap();
    carol.connect().await.unwrap();
    relay.wait_for_login("bob").await;
    relay.wait_for_login("carol").await;

    let (alice, mut alice_events) = client_for(relay.addr, dir.path(), "alice", Framing::Lines);
    let outbox = dir.path().join("outbox");
    std::fs::create_dir_all(&outbox).unwrap();
    let for_bob = vec![b'b'; 200_000];
    let for_carol = vec![b'c'; 70_000];
    std::fs::write(outbox.join("bob.dat"), &for_bob).unwrap();
    std::fs::write(outbox.join("carol.dat"), &for_carol).unwrap();

    let first = alice.spawn_send_file(outbox.join("bob.dat"), PeerId::parse("bob").unwrap());
    let second = alice.spawn_send_file(outbox.join("carol.dat"), PeerId::parse("carol").unwrap());
    let mut pending = vec![first.id(), second.id()];

    while !pending.is_empty() {
        let event = next_matching(&mut alice_events, |e| {
            matches!(
                e,
                ClientEvent::SubmissionAcknowledged { .. } | ClientEvent::TaskFailed { .. }
            )
        })
        .await;
        match event {
            ClientEvent::SubmissionAcknowledged { task, response, .. } => {
                assert!(response.contains("delivered"));
                pending.retain(|id| *id != task);
            }
            other => panic!("submission failed: {}", other.describe()),
        }
    }
    first.join().await;
    second.join().await;

    next_matching(&mut bob_events, |e| matches!(e, ClientEvent::TransferCompleted { .. })).await;
    next_matching(&mut carol_events, |e| matches!(e, ClientEvent::TransferCompleted { .. })).await;
    assert_eq!(std::fs::read(bob.dirs().received().join("bob.dat")).unwrap(), for_bob);
    assert_eq!(std::fs::read(carol.dirs().received().join("carol.dat")).unwrap(), for_carol);
    assert!(!bob.dirs().received().join("carol.dat").exists());

    bob.disconnect().await;
    carol.disconnect().await;
}

#[tokio::test]
async fn test_encrypt_send_decrypt() {
    let dir = TempDir::new().unwrap();
    let relay = FakeRelay::start().await;

    let (mut bob, mut bob_events) = client_for(relay.addr, dir.path(), "bob", Framing::Lines);
    bob.connect().await.unwrap();
    relay.wait_for_login("bob").await;

    let (alice, mut alice_events) = client_for(relay.addr, dir.path(), "alice", Framing::Lines);
    let source = dir.path().join("minutes.txt");
    let secret: Vec<u8> = b"quarterly numbers\n".repeat(5000);
    std::fs::write(&source, &secret).unwrap();

    let task = alice.spawn_send_encrypted(
        source,
        PeerId::parse("bob").unwrap(),
        "hunter2".to_string(),
        KeyLength::Aes256,
    );
    let acked = next_matching(&mut alice_events, |e| {
        matches!(
            e,
            ClientEvent::SubmissionAcknowledged { .. } | ClientEvent::TaskFailed { .. }
        )
    })
    .await;
    assert!(
        matches!(acked, ClientEvent::SubmissionAcknowledged { task: id, .. } if id == task.id()),
        "unexpected: {}",
        acked.describe()
    );

    // The staged ciphertext is what travelled over the wire
    let staged = alice.dirs().list(Folder::Encrypt).await.unwrap();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].name, "minutes.txt");

    next_matching(&mut bob_events, |e| matches!(e, ClientEvent::TransferCompleted { .. })).await;
    let received = std::fs::read(bob.dirs().received().join("minutes.txt")).unwrap();
    assert_ne!(received, secret);

    let err = bob
        .decrypt_received("minutes.txt", "wrong".to_string(), KeyLength::Aes256)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cipher);

    let plain = bob
        .decrypt_received("minutes.txt", "hunter2".to_string(), KeyLength::Aes256)
        .await
        .unwrap();
    assert_eq!(std::fs::read(plain).unwrap(), secret);

    bob.disconnect().await;
}

#[tokio::test]
async fn test_prefixed_directory_query() {
    let dir = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let relay = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = FrameReader::new(stream);
        let len = reader.read_exact(2).await.unwrap();
        let len = u16::from_be_bytes([len[0], len[1]]) as usize;
        let query = reader.read_exact(len).await.unwrap();
        assert_eq!(&query[..], b"LIST_CLIENTS");

        let (mut stream, _) = reader.into_parts();
        let response = b"alice,dave,erin";
        stream.write_all(&(response.len() as u16).to_be_bytes()).await.unwrap();
        stream.write_all(response).await.unwrap();
    });

    let (alice, _events) = client_for(addr, dir.path(), "alice", Framing::Prefixed);
    let peers = alice.list_peers().await.unwrap();
    let names: Vec<&str> = peers.iter().map(PeerId::as_str).collect();
    assert_eq!(names, vec!["dave", "erin"]);
    relay.await.unwrap();
}
