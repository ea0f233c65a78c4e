//! Integration tests for securechat
//!
//! Every test starts a real server on 127.0.0.1:0 with a freshly generated
//! PKI (CA, server certificate, one key pair per roster user) in a temp dir.
//!
//! Roster ids: alice = 0, bob = 1, charlie = 2, dave = 3.

use std::net::SocketAddr;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

use securechat::client::CA_KEY_NAME;
use securechat::crypto::{Certificate, SigningKeyPair};
use securechat::protocol::{read_frame, ClientHandshake, Request, M1, M2};
use securechat::transport::{read_field, TcpConnection, TcpListener};
use securechat::{
    ChatClient, ClientIdentity, SecureChannel, Server, ServerConfig, ServerEvent, ServerIdentity,
    DEFAULT_MAX_FRAME_LEN, FRAME_HEADER_LEN,
};

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    server: Server,
    dir: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Starts a server after letting the test adjust the config.
    async fn start_with(tune: impl FnOnce(&mut ServerConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            key_dir: dir.path().to_path_buf(),
            server_cert: dir.path().join("server_cert.pem"),
            poll_interval_ms: 50,
            proposal_timeout_secs: 1,
            handshake_timeout_secs: 2,
            ..Default::default()
        };
        tune(&mut config);

        let ca = SigningKeyPair::generate();
        ca.save_to_dir(dir.path(), CA_KEY_NAME).unwrap();
        let server_keys = SigningKeyPair::generate();
        let cert =
            Certificate::issue("server", server_keys.verifying_key(), "ca", &ca, 3600).unwrap();
        for user in &config.roster {
            SigningKeyPair::generate()
                .save_to_dir(dir.path(), user)
                .unwrap();
        }

        let identity = ServerIdentity::new(server_keys, &cert).unwrap();
        let server = Server::new(config, identity);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.clone().run(listener));

        Self { addr, server, dir }
    }

    fn identity(&self, user: &str) -> ClientIdentity {
        ClientIdentity::load(self.dir.path(), user, "server").unwrap()
    }

    async fn login(&self, user: &str) -> ChatClient {
        timeout(WAIT, ChatClient::connect(self.addr, &self.identity(user)))
            .await
            .unwrap()
            .unwrap()
    }

    fn user_keys(&self, user: &str) -> SigningKeyPair {
        SigningKeyPair::load_from_dir(self.dir.path(), user).unwrap()
    }

    fn ca_key(&self) -> ed25519_dalek::VerifyingKey {
        *SigningKeyPair::load_from_dir(self.dir.path(), CA_KEY_NAME)
            .unwrap()
            .verifying_key()
    }

    /// Handshake by hand, keeping the raw connection and channel.
    async fn raw_login(&self, user: &str) -> (TcpConnection, SecureChannel) {
        let mut conn = TcpConnection::connect(self.addr).await.unwrap();
        let hs = ClientHandshake::new(user);
        conn.send_raw(&hs.m1().encode()).await.unwrap();

        let m2 = M2::read(conn.reader()).await.unwrap();
        let (m3, key) = hs
            .process_m2(&m2, &self.user_keys(user), &self.ca_key(), "server")
            .unwrap();
        conn.send_raw(&m3.encode()).await.unwrap();

        let mut channel = SecureChannel::new(key, DEFAULT_MAX_FRAME_LEN);
        let first = channel.recv(conn.reader()).await.unwrap();
        assert!(matches!(
            ServerEvent::decode(&first).unwrap(),
            ServerEvent::UserId(_)
        ));
        (conn, channel)
    }

    async fn wait_offline(&self, id: u32) {
        let registry = self.server.registry();
        for _ in 0..250 {
            if !registry.is_online(id).unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("user {} never went offline", id);
    }
}

async fn next(client: &mut ChatClient) -> ServerEvent {
    timeout(WAIT, client.next_event()).await.unwrap().unwrap()
}

/// The first frame after the handshake carries the roster id.
#[tokio::test]
async fn test_login_assigns_roster_id() {
    let ts = TestServer::start().await;
    let alice = ts.login("alice").await;

    assert_eq!(alice.user_id(), 0);
    assert!(ts.server.registry().is_online(0).unwrap());

    let charlie = ts.login("charlie").await;
    assert_eq!(charlie.user_id(), 2);
}

/// The online list reflects who is logged in.
#[tokio::test]
async fn test_online_list() {
    let ts = TestServer::start().await;
    let mut alice = ts.login("alice").await;
    let _bob = ts.login("bob").await;

    let online = alice.list_online().await.unwrap();
    let names: Vec<&str> = online.iter().map(|u| u.username.as_str()).collect();
    assert_eq!(names, vec!["alice", "bob"]);
    assert_eq!(online[1].id, 1);
}

/// Proposing to an offline user is refused at once without touching its mailbox.
#[tokio::test]
async fn test_proposal_to_offline_user_refused() {
    let ts = TestServer::start().await;
    let mut alice = ts.login("alice").await;

    alice.propose_chat(3).await.unwrap();
    assert_eq!(next(&mut alice).await, ServerEvent::Refused { peer: 3 });
    assert_eq!(ts.server.relay().pending(3).unwrap(), 0);
    assert!(!ts.server.registry().is_busy(0).unwrap());
}

/// Proposing to yourself is refused.
#[tokio::test]
async fn test_proposal_to_self_refused() {
    let ts = TestServer::start().await;
    let mut alice = ts.login("alice").await;

    alice.propose_chat(0).await.unwrap();
    assert_eq!(next(&mut alice).await, ServerEvent::Refused { peer: 0 });
    assert!(!ts.server.registry().is_busy(0).unwrap());
}

/// alice proposes, bob accepts, then they exchange text.
#[tokio::test]
async fn test_accepted_chat_flow() {
    let ts = TestServer::start().await;
    let mut alice = ts.login("alice").await;
    let mut bob = ts.login("bob").await;

    alice.propose_chat(1).await.unwrap();

    match next(&mut bob).await {
        ServerEvent::Proposal {
            from,
            username,
            public_key,
        } => {
            assert_eq!(from, 0);
            assert_eq!(username, "alice");
            assert!(String::from_utf8(public_key).unwrap().contains("PUBLIC KEY"));
        }
        other => panic!("expected proposal, got {:?}", other),
    }
    assert!(ts.server.registry().is_busy(1).unwrap());

    bob.answer_proposal(0, true).await.unwrap();
    match next(&mut alice).await {
        ServerEvent::Accepted { from, username, .. } => {
            assert_eq!(from, 1);
            assert_eq!(username, "bob");
        }
        other => panic!("expected accept, got {:?}", other),
    }

    // A round trip makes sure alice's handler has left the proposal.
    alice.list_online().await.unwrap();
    assert!(!ts.server.registry().is_busy(0).unwrap());
    assert!(!ts.server.registry().is_busy(1).unwrap());

    alice.send_text(1, b"hello bob").await.unwrap();
    assert_eq!(
        next(&mut bob).await,
        ServerEvent::Text {
            from: 0,
            data: b"hello bob".to_vec()
        }
    );

    bob.send_control(0, b"nonce").await.unwrap();
    assert_eq!(
        next(&mut alice).await,
        ServerEvent::Control {
            from: 1,
            data: b"nonce".to_vec()
        }
    );

    bob.stop_chat(0).await.unwrap();
    assert_eq!(next(&mut alice).await, ServerEvent::ChatStopped { peer: 1 });
}

/// bob refuses; alice sees the refusal and both are free again.
#[tokio::test]
async fn test_refused_chat_flow() {
    let ts = TestServer::start().await;
    let mut alice = ts.login("alice").await;
    let mut bob = ts.login("bob").await;

    alice.propose_chat(1).await.unwrap();
    assert!(matches!(next(&mut bob).await, ServerEvent::Proposal { from: 0, .. }));

    bob.answer_proposal(0, false).await.unwrap();
    assert_eq!(next(&mut alice).await, ServerEvent::Refused { peer: 1 });

    alice.list_online().await.unwrap();
    assert!(!ts.server.registry().is_busy(0).unwrap());
    assert!(!ts.server.registry().is_busy(1).unwrap());
}

/// A user with a pending proposal is busy for everyone else.
#[tokio::test]
async fn test_busy_peer_refused() {
    let ts = TestServer::start().await;
    let mut alice = ts.login("alice").await;
    let mut bob = ts.login("bob").await;
    let mut charlie = ts.login("charlie").await;

    alice.propose_chat(1).await.unwrap();
    assert!(matches!(next(&mut bob).await, ServerEvent::Proposal { .. }));

    charlie.propose_chat(1).await.unwrap();
    assert_eq!(next(&mut charlie).await, ServerEvent::Refused { peer: 1 });
    assert_eq!(ts.server.relay().pending(1).unwrap(), 0);

    bob.answer_proposal(0, true).await.unwrap();
    assert!(matches!(next(&mut alice).await, ServerEvent::Accepted { from: 1, .. }));
}

/// An unanswered proposal times out as a refusal and frees both users.
#[tokio::test]
async fn test_proposal_timeout() {
    let ts = TestServer::start().await;
    let mut alice = ts.login("alice").await;
    let mut bob = ts.login("bob").await;

    alice.propose_chat(1).await.unwrap();
    assert!(matches!(next(&mut bob).await, ServerEvent::Proposal { .. }));

    assert_eq!(next(&mut alice).await, ServerEvent::Refused { peer: 1 });
    alice.list_online().await.unwrap();
    assert!(!ts.server.registry().is_busy(0).unwrap());
    assert!(!ts.server.registry().is_busy(1).unwrap());
}

/// A proposal the responder saw but never answered is refused when it leaves.
#[tokio::test]
async fn test_seen_proposal_refused_when_peer_disconnects() {
    let ts = TestServer::start_with(|c| c.proposal_timeout_secs = 30).await;
    let mut alice = ts.login("alice").await;
    let mut bob = ts.login("bob").await;

    alice.propose_chat(1).await.unwrap();
    assert!(matches!(next(&mut bob).await, ServerEvent::Proposal { from: 0, .. }));
    drop(bob);

    // Well inside the 30 s proposal timeout.
    assert_eq!(next(&mut alice).await, ServerEvent::Refused { peer: 1 });
    alice.list_online().await.unwrap();
    assert!(!ts.server.registry().is_busy(0).unwrap());
}

/// A proposal still queued when the responder exits is refused at once.
#[tokio::test]
async fn test_queued_proposal_refused_when_peer_exits() {
    let ts = TestServer::start_with(|c| {
        c.poll_interval_ms = 10_000;
        c.proposal_timeout_secs = 30;
    })
    .await;
    let bob = ts.login("bob").await;
    let mut alice = ts.login("alice").await;

    alice.propose_chat(1).await.unwrap();
    let relay = ts.server.relay();
    for _ in 0..250 {
        if relay.pending(1).unwrap() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(relay.pending(1).unwrap(), 1);

    bob.exit().await.unwrap();
    assert_eq!(next(&mut alice).await, ServerEvent::Refused { peer: 1 });
}

/// However the responder's exit interleaves with the proposal, the
/// initiator gets its refusal long before the proposal timeout.
#[tokio::test]
async fn test_proposal_racing_peer_exit_resolves_quickly() {
    let ts = TestServer::start_with(|c| c.proposal_timeout_secs = 30).await;
    let mut alice = ts.login("alice").await;

    for _ in 0..10 {
        let bob = ts.login("bob").await;
        alice.propose_chat(1).await.unwrap();
        drop(bob);

        assert_eq!(next(&mut alice).await, ServerEvent::Refused { peer: 1 });
        ts.wait_offline(1).await;
        alice.list_online().await.unwrap();
        assert!(!ts.server.registry().is_busy(0).unwrap());
    }
}

/// An accept that arrives after the proposal timed out ends the chat for the
/// responder and never reaches the initiator.
#[tokio::test]
async fn test_late_accept_after_timeout_stops_chat() {
    let ts = TestServer::start().await;
    let mut alice = ts.login("alice").await;
    let mut bob = ts.login("bob").await;

    alice.propose_chat(1).await.unwrap();
    assert!(matches!(next(&mut bob).await, ServerEvent::Proposal { .. }));
    assert_eq!(next(&mut alice).await, ServerEvent::Refused { peer: 1 });

    bob.answer_proposal(0, true).await.unwrap();
    assert_eq!(next(&mut bob).await, ServerEvent::ChatStopped { peer: 0 });
    assert!(timeout(Duration::from_millis(300), alice.next_event())
        .await
        .is_err());
}

/// Messages left for a user while offline are not delivered to the next login.
#[tokio::test]
async fn test_stale_mailbox_cleared_at_login() {
    let ts = TestServer::start().await;
    let mut alice = ts.login("alice").await;

    alice.stop_chat(1).await.unwrap();
    alice.list_online().await.unwrap();
    assert_eq!(ts.server.relay().pending(1).unwrap(), 1);

    let mut bob = ts.login("bob").await;
    assert_eq!(ts.server.relay().pending(1).unwrap(), 0);
    assert!(timeout(Duration::from_millis(300), bob.next_event())
        .await
        .is_err());
}

/// Mailbox traffic that arrives while a proposal is pending is held back
/// until the answer, and polling picks up again afterwards.
#[tokio::test]
async fn test_mail_deferred_during_proposal() {
    let ts = TestServer::start_with(|c| c.proposal_timeout_secs = 30).await;
    let mut alice = ts.login("alice").await;
    let mut bob = ts.login("bob").await;
    let mut charlie = ts.login("charlie").await;

    alice.propose_chat(1).await.unwrap();
    assert!(matches!(next(&mut bob).await, ServerEvent::Proposal { .. }));

    charlie.send_text(0, b"first").await.unwrap();
    charlie.list_online().await.unwrap();
    // Several poll periods pass without delivery.
    assert!(timeout(Duration::from_millis(300), alice.next_event())
        .await
        .is_err());

    bob.answer_proposal(0, true).await.unwrap();
    assert!(matches!(next(&mut alice).await, ServerEvent::Accepted { from: 1, .. }));
    assert_eq!(
        next(&mut alice).await,
        ServerEvent::Text {
            from: 2,
            data: b"first".to_vec()
        }
    );

    charlie.send_text(0, b"second").await.unwrap();
    assert_eq!(
        next(&mut alice).await,
        ServerEvent::Text {
            from: 2,
            data: b"second".to_vec()
        }
    );
}

/// Chat traffic to a user who left comes back as STOP_CHAT.
#[tokio::test]
async fn test_text_to_offline_peer_stops_chat() {
    let ts = TestServer::start().await;
    let mut alice = ts.login("alice").await;

    alice.send_text(2, b"anyone?").await.unwrap();
    assert_eq!(next(&mut alice).await, ServerEvent::ChatStopped { peer: 2 });
}

/// EXIT releases the user so the same name can log in again.
#[tokio::test]
async fn test_exit_releases_user() {
    let ts = TestServer::start().await;
    let alice = ts.login("alice").await;
    alice.exit().await.unwrap();

    ts.wait_offline(0).await;
    let again = ts.login("alice").await;
    assert_eq!(again.user_id(), 0);
}

/// A second concurrent login for the same user is refused during the handshake.
#[tokio::test]
async fn test_duplicate_login_refused() {
    let ts = TestServer::start().await;
    let _alice = ts.login("alice").await;

    let second = ChatClient::connect(ts.addr, &ts.identity("alice")).await;
    assert!(second.is_err());
    assert!(ts.server.registry().is_online(0).unwrap());
}

/// Usernames outside the roster never get an M2.
#[tokio::test]
async fn test_unknown_user_rejected() {
    let ts = TestServer::start().await;
    let mut conn = TcpConnection::connect(ts.addr).await.unwrap();
    let m1 = M1 {
        r1: [1; 16],
        username: "mallory".to_string(),
    };
    conn.send_raw(&m1.encode()).await.unwrap();

    let result = timeout(WAIT, M2::read(conn.reader())).await.unwrap();
    assert!(result.is_err());
}

/// A corrupted server signature makes the client abort before deriving a key.
#[tokio::test]
async fn test_tampered_m2_signature_rejected_by_client() {
    let ts = TestServer::start().await;
    let mut conn = TcpConnection::connect(ts.addr).await.unwrap();
    let hs = ClientHandshake::new("alice");
    conn.send_raw(&hs.m1().encode()).await.unwrap();

    let mut m2 = M2::read(conn.reader()).await.unwrap();
    m2.signature[5] ^= 0x80;

    let result = hs.process_m2(&m2, &ts.user_keys("alice"), &ts.ca_key(), "server");
    assert!(result.is_err());
    assert!(!ts.server.registry().is_online(0).unwrap());
}

/// A corrupted client signature is rejected before the user is marked online.
#[tokio::test]
async fn test_tampered_m3_signature_rejected_by_server() {
    let ts = TestServer::start().await;
    let mut conn = TcpConnection::connect(ts.addr).await.unwrap();
    let hs = ClientHandshake::new("alice");
    conn.send_raw(&hs.m1().encode()).await.unwrap();

    let m2 = M2::read(conn.reader()).await.unwrap();
    let (mut m3, key) = hs
        .process_m2(&m2, &ts.user_keys("alice"), &ts.ca_key(), "server")
        .unwrap();
    m3.signature[0] ^= 0x01;
    conn.send_raw(&m3.encode()).await.unwrap();

    let mut channel = SecureChannel::new(key, DEFAULT_MAX_FRAME_LEN);
    let result = timeout(WAIT, channel.recv(conn.reader())).await.unwrap();
    assert!(result.is_err());
    assert!(!ts.server.registry().is_online(0).unwrap());
}

/// A certificate from another CA is refused by the client.
#[tokio::test]
async fn test_untrusted_server_certificate() {
    let ts = TestServer::start().await;
    let other_ca = SigningKeyPair::generate();
    let identity = ClientIdentity::new(
        "alice",
        ts.user_keys("alice"),
        *other_ca.verifying_key(),
        "server",
    );

    let result = ChatClient::connect(ts.addr, &identity).await;
    assert!(result.is_err());
}

/// A frame whose length field disagrees with its ciphertext kills only that session.
#[tokio::test]
async fn test_inconsistent_frame_length_closes_connection() {
    let ts = TestServer::start().await;
    let (mut conn, mut channel) = ts.raw_login("alice").await;

    let mut frame = channel.seal_frame(&Request::Online.encode()).unwrap();
    let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    frame[..4].copy_from_slice(&(len - 1).to_be_bytes());
    conn.send_raw(&frame).await.unwrap();

    let reply = timeout(WAIT, read_frame(conn.reader(), DEFAULT_MAX_FRAME_LEN))
        .await
        .unwrap();
    assert!(reply.is_err());
    ts.wait_offline(0).await;

    // The server is still serving.
    let alice = ts.login("alice").await;
    assert_eq!(alice.user_id(), 0);
}

/// An oversized length field is rejected without waiting for the body.
#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let ts = TestServer::start().await;
    let (mut conn, _channel) = ts.raw_login("alice").await;

    let mut header = [0u8; FRAME_HEADER_LEN];
    header[..4].copy_from_slice(&u32::MAX.to_be_bytes());
    conn.send_raw(&header).await.unwrap();

    let reply = timeout(WAIT, read_field(conn.reader(), "any", 16)).await.unwrap();
    assert!(reply.is_err());
    ts.wait_offline(0).await;
}

/// Sending the same sealed frame twice ends the session on the replay.
#[tokio::test]
async fn test_replayed_frame_closes_connection() {
    let ts = TestServer::start().await;
    let (mut conn, mut channel) = ts.raw_login("alice").await;

    let frame = channel.seal_frame(&Request::Online.encode()).unwrap();
    conn.send_raw(&frame).await.unwrap();
    let reply = channel.recv(conn.reader()).await.unwrap();
    assert!(matches!(
        ServerEvent::decode(&reply).unwrap(),
        ServerEvent::OnlineUsers(_)
    ));

    conn.send_raw(&frame).await.unwrap();
    let after = timeout(WAIT, channel.recv(conn.reader())).await.unwrap();
    assert!(after.is_err());
    ts.wait_offline(0).await;
}

/// Skipping ahead in the sequence space is accepted.
#[tokio::test]
async fn test_forward_sequence_jump_accepted() {
    let ts = TestServer::start().await;
    let (mut conn, mut channel) = ts.raw_login("alice").await;

    let skipped = channel.seal_frame(&Request::Online.encode()).unwrap();
    drop(skipped);
    let frame = channel.seal_frame(&Request::Online.encode()).unwrap();
    conn.send_raw(&frame).await.unwrap();

    let reply = timeout(WAIT, channel.recv(conn.reader())).await.unwrap().unwrap();
    assert!(matches!(
        ServerEvent::decode(&reply).unwrap(),
        ServerEvent::OnlineUsers(_)
    ));
}

/// Unknown opcodes are ignored and the session continues.
#[tokio::test]
async fn test_unknown_opcode_ignored() {
    let ts = TestServer::start().await;
    let (mut conn, mut channel) = ts.raw_login("alice").await;

    channel.send(conn.writer(), &[0x7F, 1, 2, 3]).await.unwrap();
    channel
        .send(conn.writer(), &Request::Online.encode())
        .await
        .unwrap();

    let reply = timeout(WAIT, channel.recv(conn.reader())).await.unwrap().unwrap();
    assert!(matches!(
        ServerEvent::decode(&reply).unwrap(),
        ServerEvent::OnlineUsers(_)
    ));
}
