//! End-to-end recovery scenarios against an in-process server.
//!
//! Each test starts the real axum router over an in-memory sqlite store and
//! the in-process broker on an ephemeral port, then drives devices through
//! the WebSocket transport and the HTTP sync endpoint.

use chatseq_client::{ChatApi, ChatClient, ClientConfig, CoordinatorHandle, HttpChatApi, WsTransport};
use seq_core::{ConnectionState, SyncStatus};
use seq_server::broker::MemoryBroker;
use seq_server::http::build_router;
use seq_server::storage::SqliteStore;
use seq_server::{ChatServer, Config};
use seq_types::{ChatId, NewMessage, SeqNum, UserId};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(10);

struct TestServer {
    server: Arc<ChatServer>,
    url: String,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start(config: Config) -> Self {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let broker = Arc::new(MemoryBroker::new(&config.broker));
        let server = Arc::new(ChatServer::new(config, store, broker));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let app = build_router(server.clone());
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { server, url, task }
    }

    fn api(&self, user: UserId) -> HttpChatApi {
        HttpChatApi::new(self.url.clone(), user)
    }

    /// A chat with the given participants.
    async fn chat(&self, users: &[UserId]) -> ChatId {
        let chat = ChatId::new();
        for user in users {
            self.server.add_participant(&chat, user).await.unwrap();
        }
        chat
    }

    async fn post(&self, chat: &ChatId, sender: UserId, count: usize) {
        let api = self.api(sender);
        for i in 0..count {
            api.send(chat, &NewMessage::new(format!("message {i}"))).await.unwrap();
        }
    }

    /// Wait until the publisher has fanned out `count` publications, one per
    /// chat channel plus one per participant channel.
    async fn wait_published(&self, count: u64) {
        let metrics = self.server.metrics();
        tokio::time::timeout(WAIT, async {
            while metrics.publishes_total.load(Ordering::Relaxed) < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("publications not fanned out in time");
    }

    fn sync_requests(&self) -> u64 {
        self.server.metrics().sync_requests_total.load(Ordering::Relaxed)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Device {
    client: ChatClient<HttpChatApi>,
    _dir: TempDir,
}

impl Device {
    async fn open(server: &TestServer, user: UserId, chats: &[ChatId]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::open_in(server, user, chats, dir).await
    }

    async fn open_in(server: &TestServer, user: UserId, chats: &[ChatId], dir: TempDir) -> Self {
        let mut config = ClientConfig::new(server.url.clone(), user);
        config.chats = chats.to_vec();
        config.cursor_dir = dir.path().to_path_buf();
        config.page_size = 2;
        config.retry.initial_delay_ms = 20;
        config.retry.max_delay_ms = 200;
        config.retry.attempt_timeout_ms = 2_000;

        let client = ChatClient::open(config).await.unwrap();
        Self { client, _dir: dir }
    }

    async fn watch(&self) -> CoordinatorHandle {
        let handle = self.client.watch(Arc::new(WsTransport::new()));
        tokio::time::timeout(WAIT, handle.wait_for_state(|s| *s == ConnectionState::Subscribed))
            .await
            .expect("device did not subscribe in time")
            .unwrap();
        handle
    }

    async fn wait_for(&self, chat: &ChatId, count: usize) {
        let merger = self.client.merger();
        tokio::time::timeout(WAIT, async {
            while merger.applied_count(chat).await < count {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("messages not applied in time");
    }

    async fn seqs(&self, chat: &ChatId) -> Vec<u64> {
        self.client
            .merger()
            .messages(chat)
            .await
            .iter()
            .map(|m| m.seq_num.value())
            .collect()
    }

    async fn cursor(&self, chat: &ChatId) -> SeqNum {
        self.client.merger().cursor(chat).await.unwrap()
    }
}

// ============================================================================
// Live delivery
// ============================================================================

/// Messages appended while a device is subscribed arrive in order.
#[tokio::test]
async fn live_messages_arrive_in_order() {
    let server = TestServer::start(Config::default()).await;
    let (alice, bob) = (UserId::new(), UserId::new());
    let chat = server.chat(&[alice, bob]).await;

    let device = Device::open(&server, alice, &[chat]).await;
    let handle = device.watch().await;

    server.post(&chat, bob, 5).await;
    device.wait_for(&chat, 5).await;

    assert_eq!(device.seqs(&chat).await, vec![1, 2, 3, 4, 5]);
    assert_eq!(device.cursor(&chat).await, SeqNum::new(5));
    assert_eq!(server.sync_requests(), 0);

    handle.shutdown().await.unwrap();
}

/// Re-sending the same message id yields the original commit.
#[tokio::test]
async fn resent_message_keeps_its_seq_num() {
    let server = TestServer::start(Config::default()).await;
    let alice = UserId::new();
    let chat = server.chat(&[alice]).await;
    let api = server.api(alice);

    let message = NewMessage::new("hello");
    let first = api.send(&chat, &message).await.unwrap();
    let again = api.send(&chat, &message).await.unwrap();
    let next = api.send(&chat, &NewMessage::new("world")).await.unwrap();

    assert_eq!(first, again);
    assert_eq!(next.seq_num, SeqNum::new(2));
}

// ============================================================================
// Reconnect recovery
// ============================================================================

/// Offline within the broker history: the broker replays what was missed
/// and the sync endpoint is never called.
#[tokio::test]
async fn reconnect_within_history_recovers_via_broker() {
    let server = TestServer::start(Config::default()).await;
    let (alice, bob) = (UserId::new(), UserId::new());
    let chat = server.chat(&[alice, bob]).await;

    let device = Device::open(&server, alice, &[chat]).await;
    let handle = device.watch().await;
    server.post(&chat, bob, 3).await;
    device.wait_for(&chat, 3).await;
    handle.shutdown().await.unwrap();

    server.post(&chat, bob, 2).await;
    server.wait_published(5 * 3).await;

    let handle = device.watch().await;
    device.wait_for(&chat, 5).await;

    assert_eq!(device.seqs(&chat).await, vec![1, 2, 3, 4, 5]);
    assert_eq!(server.sync_requests(), 0);
    assert!(server.server.metrics().recoveries_total.load(Ordering::Relaxed) >= 1);
    assert_eq!(handle.status(&chat), Some(SyncStatus::InSync));

    handle.shutdown().await.unwrap();
}

/// Offline past the broker history: recovery fails and the sync endpoint
/// fills exactly the missing range.
#[tokio::test]
async fn reconnect_past_history_falls_back_to_sync() {
    let mut config = Config::default();
    config.broker.history_size = 2;
    let server = TestServer::start(config).await;
    let (alice, bob) = (UserId::new(), UserId::new());
    let chat = server.chat(&[alice, bob]).await;

    let device = Device::open(&server, alice, &[chat]).await;
    let handle = device.watch().await;
    server.post(&chat, bob, 1).await;
    device.wait_for(&chat, 1).await;
    handle.shutdown().await.unwrap();

    server.post(&chat, bob, 6).await;
    server.wait_published(7 * 3).await;

    let handle = device.watch().await;
    device.wait_for(&chat, 7).await;

    assert_eq!(device.seqs(&chat).await, (1..=7).collect::<Vec<_>>());
    assert_eq!(device.cursor(&chat).await, SeqNum::new(7));
    // Six missing messages at two per page.
    assert!(server.sync_requests() >= 3);
    assert_eq!(handle.status(&chat), Some(SyncStatus::InSync));

    handle.shutdown().await.unwrap();
}

/// A reopened device resumes from the cursor it persisted.
#[tokio::test]
async fn cursor_survives_restart() {
    let server = TestServer::start(Config::default()).await;
    let (alice, bob) = (UserId::new(), UserId::new());
    let chat = server.chat(&[alice, bob]).await;
    let dir = tempfile::tempdir().unwrap();

    let device = Device::open_in(&server, alice, &[chat], dir).await;
    let handle = device.watch().await;
    server.post(&chat, bob, 4).await;
    device.wait_for(&chat, 4).await;
    handle.shutdown().await.unwrap();
    let Device { client, _dir: dir } = device;
    drop(client);

    server.post(&chat, bob, 1).await;

    let reopened = Device::open_in(&server, alice, &[chat], dir).await;
    assert_eq!(reopened.cursor(&chat).await, SeqNum::new(4));
    let handle = reopened.watch().await;
    reopened.wait_for(&chat, 1).await;

    // Only the message after the cursor is delivered again.
    assert_eq!(reopened.seqs(&chat).await, vec![5]);

    handle.shutdown().await.unwrap();
}

// ============================================================================
// Convergence
// ============================================================================

/// Two devices of one user, one of them offline for a while, end up with
/// identical message sequences.
#[tokio::test]
async fn devices_converge() {
    let mut config = Config::default();
    config.broker.history_size = 3;
    let server = TestServer::start(config).await;
    let (alice, bob) = (UserId::new(), UserId::new());
    let chat = server.chat(&[alice, bob]).await;

    let phone = Device::open(&server, alice, &[chat]).await;
    let laptop = Device::open(&server, alice, &[chat]).await;
    let phone_handle = phone.watch().await;
    let laptop_handle = laptop.watch().await;

    server.post(&chat, bob, 2).await;
    phone.wait_for(&chat, 2).await;
    laptop.wait_for(&chat, 2).await;

    laptop_handle.shutdown().await.unwrap();
    server.post(&chat, bob, 5).await;
    server.post(&chat, alice, 2).await;
    phone.wait_for(&chat, 9).await;
    server.wait_published(9 * 3).await;

    let laptop_handle = laptop.watch().await;
    laptop.wait_for(&chat, 9).await;

    let expected: Vec<u64> = (1..=9).collect();
    assert_eq!(phone.seqs(&chat).await, expected);
    assert_eq!(laptop.seqs(&chat).await, expected);
    assert_ne!(phone.client.device_id(), laptop.client.device_id());

    phone_handle.shutdown().await.unwrap();
    laptop_handle.shutdown().await.unwrap();
}

/// One-shot sync catches a device up without a broker connection.
#[tokio::test]
async fn one_shot_sync_catches_up() {
    let server = TestServer::start(Config::default()).await;
    let (alice, bob) = (UserId::new(), UserId::new());
    let chat = server.chat(&[alice, bob]).await;
    server.post(&chat, bob, 5).await;

    let device = Device::open(&server, alice, &[chat]).await;
    let applied = device.client.sync_chat(&chat).await.unwrap();

    assert_eq!(applied.len(), 5);
    assert_eq!(device.cursor(&chat).await, SeqNum::new(5));
    assert!(device.client.sync_chat(&chat).await.unwrap().is_empty());
}

/// A non-participant cannot sync.
#[tokio::test]
async fn outsider_sync_is_denied() {
    let server = TestServer::start(Config::default()).await;
    let alice = UserId::new();
    let chat = server.chat(&[alice]).await;
    server.post(&chat, alice, 1).await;

    let outsider = Device::open(&server, UserId::new(), &[chat]).await;
    let err = outsider.client.sync_chat(&chat).await.unwrap_err();

    assert!(err.to_string().contains("403"));
}
