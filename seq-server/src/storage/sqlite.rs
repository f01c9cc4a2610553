//! SQLite sequence store.
//!
//! `chat_sequences` holds the next `seq_num` per chat. An append bumps it with
//! an upsert `RETURNING` the assigned number and inserts the row inside the
//! same transaction, so a rolled-back append gives its number back.
//!
//! Known deviation: SQLite serializes writers database-wide, so appends to
//! different chats contend with each other instead of proceeding
//! independently. Numbers are never duplicated or reordered. A backend with
//! row-level locking on `chat_sequences` removes the contention without
//! changing [`MessageStore`].

use super::{AppendOutcome, AppendRequest, MessageStore};
use crate::error::StorageError;
use async_trait::async_trait;
use seq_types::{ChatId, ChatMessage, MessageId, SeqNum, UserId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

const MESSAGE_COLUMNS: &str =
    "id, chat_id, seq_num, sender_id, content, created_at, updated_at, deleted";

/// SQLite-based sequence store.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub async fn new(path: &Path) -> Result<Self, StorageError> {
        let path_str = path.to_str().ok_or_else(|| StorageError::InvalidPath {
            path: path.to_path_buf(),
        })?;
        let options = SqliteConnectOptions::from_str(path_str)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:")?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_sequences (
                chat_id TEXT PRIMARY KEY,
                next_seq INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                seq_num INTEGER NOT NULL,
                sender_id TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER,
                deleted INTEGER NOT NULL DEFAULT 0,
                UNIQUE(chat_id, seq_num)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_participants (
                chat_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                joined_at INTEGER NOT NULL,
                PRIMARY KEY (chat_id, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Bump the chat counter and return the number it handed out.
    async fn next_seq(tx: &mut Transaction<'_, Sqlite>, chat_id: &ChatId) -> Result<SeqNum, StorageError> {
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO chat_sequences (chat_id, next_seq)
            VALUES (?1, 2)
            ON CONFLICT(chat_id) DO UPDATE SET next_seq = next_seq + 1
            RETURNING next_seq - 1
            "#,
        )
        .bind(chat_id.to_string())
        .fetch_one(&mut **tx)
        .await?;

        Ok(SeqNum::new(seq as u64))
    }

    async fn find_by_id(
        tx: &mut Transaction<'_, Sqlite>,
        id: &MessageId,
    ) -> Result<Option<ChatMessage>, StorageError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut **tx)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    fn current_timestamp() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(&self, req: AppendRequest) -> Result<AppendOutcome, StorageError> {
        let mut tx = self.pool.begin().await?;

        // Write first: taking the write lock up front avoids a read→write
        // upgrade that SQLite would fail with SQLITE_BUSY.
        let seq = Self::next_seq(&mut tx, &req.chat_id).await?;

        if let Some(existing) = Self::find_by_id(&mut tx, &req.id).await? {
            tx.rollback().await?;
            if existing.chat_id != req.chat_id {
                return Err(StorageError::IdConflict {
                    message_id: req.id.to_string(),
                });
            }
            return Ok(AppendOutcome::Existing(existing));
        }

        sqlx::query(
            r#"
            INSERT INTO messages (id, chat_id, seq_num, sender_id, content, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(req.id.to_string())
        .bind(req.chat_id.to_string())
        .bind(seq.value() as i64)
        .bind(req.sender_id.to_string())
        .bind(&req.content)
        .bind(req.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(AppendOutcome::Committed(ChatMessage {
            id: req.id,
            chat_id: req.chat_id,
            seq_num: seq,
            sender_id: req.sender_id,
            content: req.content,
            created_at: req.created_at,
            updated_at: None,
            deleted: false,
        }))
    }

    async fn messages_after(
        &self,
        chat_id: &ChatId,
        after: SeqNum,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE chat_id = ?1 AND seq_num > ?2
            ORDER BY seq_num ASC
            LIMIT ?3
            "#
        ))
        .bind(chat_id.to_string())
        .bind(after.value() as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn add_participant(&self, chat_id: &ChatId, user_id: &UserId) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO chat_participants (chat_id, user_id, joined_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(chat_id, user_id) DO NOTHING
            "#,
        )
        .bind(chat_id.to_string())
        .bind(user_id.to_string())
        .bind(Self::current_timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn is_participant(&self, chat_id: &ChatId, user_id: &UserId) -> Result<bool, StorageError> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM chat_participants WHERE chat_id = ?1 AND user_id = ?2",
        )
        .bind(chat_id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.is_some())
    }

    async fn participants(&self, chat_id: &ChatId) -> Result<Vec<UserId>, StorageError> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT user_id FROM chat_participants WHERE chat_id = ?1 ORDER BY joined_at, user_id",
        )
        .bind(chat_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        ids.iter()
            .map(|s| parse_id(s, "chat_participants"))
            .collect()
    }
}

/// Internal row type for SQLite queries.
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    chat_id: String,
    seq_num: i64,
    sender_id: String,
    content: String,
    created_at: i64,
    updated_at: Option<i64>,
    deleted: bool,
}

fn parse_id<T: FromStr<Err = seq_types::SeqError>>(s: &str, table: &'static str) -> Result<T, StorageError> {
    s.parse().map_err(|e: seq_types::SeqError| StorageError::Corrupt {
        table,
        reason: e.to_string(),
    })
}

impl TryFrom<MessageRow> for ChatMessage {
    type Error = StorageError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(ChatMessage {
            id: parse_id(&row.id, "messages")?,
            chat_id: parse_id(&row.chat_id, "messages")?,
            seq_num: SeqNum::new(row.seq_num as u64),
            sender_id: parse_id(&row.sender_id, "messages")?,
            content: row.content,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted: row.deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn request(chat_id: ChatId, content: &str) -> AppendRequest {
        AppendRequest {
            id: MessageId::new(),
            chat_id,
            sender_id: UserId::new(),
            content: content.to_string(),
            created_at: 1_705_000_000_000,
        }
    }

    async fn append_new(store: &SqliteStore, req: AppendRequest) -> ChatMessage {
        match store.append(req).await.unwrap() {
            AppendOutcome::Committed(m) => m,
            other => panic!("expected commit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_append_gets_seq_one() {
        let store = SqliteStore::in_memory().await.unwrap();
        let msg = append_new(&store, request(ChatId::new(), "hello")).await;
        assert_eq!(msg.seq_num, SeqNum::new(1));
        assert!(!msg.deleted);
    }

    #[tokio::test]
    async fn seq_is_monotonic_per_chat() {
        let store = SqliteStore::in_memory().await.unwrap();
        let chat = ChatId::new();
        for expected in 1..=5 {
            let msg = append_new(&store, request(chat, "m")).await;
            assert_eq!(msg.seq_num, SeqNum::new(expected));
        }
        let stored = store.messages_after(&chat, SeqNum::zero(), 100).await.unwrap();
        assert_eq!(stored.last().map(|m| m.seq_num), Some(SeqNum::new(5)));
    }

    #[tokio::test]
    async fn chats_have_independent_sequences() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = ChatId::new();
        let b = ChatId::new();

        assert_eq!(append_new(&store, request(a, "a1")).await.seq_num.value(), 1);
        assert_eq!(append_new(&store, request(b, "b1")).await.seq_num.value(), 1);
        assert_eq!(append_new(&store, request(a, "a2")).await.seq_num.value(), 2);
    }

    #[tokio::test]
    async fn reappending_same_id_returns_original() {
        let store = SqliteStore::in_memory().await.unwrap();
        let chat = ChatId::new();
        let req = request(chat, "once");
        let first = append_new(&store, req.clone()).await;

        let again = store.append(req).await.unwrap();
        assert_eq!(again, AppendOutcome::Existing(first.clone()));

        // The replay consumed no number.
        let next = append_new(&store, request(chat, "next")).await;
        assert_eq!(next.seq_num, SeqNum::new(2));
    }

    #[tokio::test]
    async fn id_reused_in_other_chat_conflicts() {
        let store = SqliteStore::in_memory().await.unwrap();
        let req = request(ChatId::new(), "x");
        append_new(&store, req.clone()).await;

        let other = AppendRequest {
            chat_id: ChatId::new(),
            ..req
        };
        assert!(matches!(
            store.append(other).await,
            Err(StorageError::IdConflict { .. })
        ));
    }

    #[tokio::test]
    async fn messages_after_is_ascending_and_limited() {
        let store = SqliteStore::in_memory().await.unwrap();
        let chat = ChatId::new();
        for i in 0..10 {
            append_new(&store, request(chat, &format!("m{i}"))).await;
        }

        let page = store.messages_after(&chat, SeqNum::new(2), 3).await.unwrap();
        let seqs: Vec<u64> = page.iter().map(|m| m.seq_num.value()).collect();
        assert_eq!(seqs, vec![3, 4, 5]);

        let tail = store.messages_after(&chat, SeqNum::new(8), 100).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "m8");
    }

    #[tokio::test]
    async fn messages_after_is_repeatable() {
        let store = SqliteStore::in_memory().await.unwrap();
        let chat = ChatId::new();
        for _ in 0..4 {
            append_new(&store, request(chat, "m")).await;
        }
        let first = store.messages_after(&chat, SeqNum::zero(), 100).await.unwrap();
        let second = store.messages_after(&chat, SeqNum::zero(), 100).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn ping_answers() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn participants_roundtrip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let chat = ChatId::new();
        let alice = UserId::new();
        let bob = UserId::new();

        assert!(store.add_participant(&chat, &alice).await.unwrap());
        assert!(!store.add_participant(&chat, &alice).await.unwrap());
        store.add_participant(&chat, &bob).await.unwrap();

        assert!(store.is_participant(&chat, &alice).await.unwrap());
        assert!(!store.is_participant(&ChatId::new(), &alice).await.unwrap());

        let mut members = store.participants(&chat).await.unwrap();
        members.sort();
        let mut expected = vec![alice, bob];
        expected.sort();
        assert_eq!(members, expected);
    }

    #[tokio::test]
    async fn concurrent_appends_never_share_a_number() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(&dir.path().join("seq.db")).await.unwrap());
        let chat = ChatId::new();

        let mut handles = Vec::new();
        for writer in 0..4 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    store
                        .append(request(chat, &format!("w{writer}-{i}")))
                        .await
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let all = store.messages_after(&chat, SeqNum::zero(), 1000).await.unwrap();
        let seqs: Vec<u64> = all.iter().map(|m| m.seq_num.value()).collect();
        assert_eq!(seqs, (1..=40).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn data_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq.db");
        let chat = ChatId::new();
        {
            let store = SqliteStore::new(&path).await.unwrap();
            append_new(&store, request(chat, "kept")).await;
        }
        let store = SqliteStore::new(&path).await.unwrap();
        let next = append_new(&store, request(chat, "after reopen")).await;
        assert_eq!(next.seq_num, SeqNum::new(2));
    }
}
