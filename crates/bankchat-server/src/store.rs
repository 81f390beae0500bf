use bankchat_config::Store;
use bankchat_contracts::{Channel, MessageRecord, Sender};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

/// A message before the log has assigned its id.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: Option<i64>,
    pub user_id: i64,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub channel: Channel,
    pub state_code: String,
    pub sender: Sender,
}

impl NewMessage {
    fn into_record(self, id: i64) -> MessageRecord {
        MessageRecord {
            id,
            chat_id: self.chat_id,
            user_id: self.user_id,
            text: self.text,
            timestamp: format_ts(self.timestamp),
            channel: self.channel,
            state_code: self.state_code,
            sender: self.sender,
        }
    }
}

/// Fixed-width UTC timestamps so lexical order equals time order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Default)]
pub struct MemoryStore {
    messages: Vec<MessageRecord>,
    last_id: i64,
}

pub struct SqliteStore {
    conn: Connection,
}

/// Conversation log. Callers hold it behind one async mutex, so a pair
/// appended by `append_exchange` is never observed half-written.
pub enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl StoreBackend {
    pub fn open(cfg: &Store) -> Result<Self, String> {
        if cfg.kind == "sqlite" {
            let sqlite_path = cfg
                .sqlite_path
                .as_deref()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            Ok(StoreBackend::Sqlite(SqliteStore::new(sqlite_path)?))
        } else {
            Ok(StoreBackend::Memory(MemoryStore::default()))
        }
    }

    pub fn append(&mut self, message: NewMessage) -> Result<MessageRecord, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.push(message)),
            StoreBackend::Sqlite(store) => store.append(message),
        }
    }

    pub fn append_exchange(
        &mut self,
        user: NewMessage,
        assistant: NewMessage,
    ) -> Result<(MessageRecord, MessageRecord), String> {
        match self {
            StoreBackend::Memory(store) => {
                let user = store.push(user);
                let assistant = store.push(assistant);
                Ok((user, assistant))
            }
            StoreBackend::Sqlite(store) => store.append_exchange(user, assistant),
        }
    }

    /// Most recent `limit` messages, returned oldest first.
    pub fn history(
        &self,
        chat_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.history(chat_id, limit)),
            StoreBackend::Sqlite(store) => store.history(chat_id, limit),
        }
    }

    pub fn get(&self, id: i64) -> Result<Option<MessageRecord>, String> {
        match self {
            StoreBackend::Memory(store) => {
                Ok(store.messages.iter().find(|m| m.id == id).cloned())
            }
            StoreBackend::Sqlite(store) => store.get(id),
        }
    }
}

impl MemoryStore {
    fn push(&mut self, message: NewMessage) -> MessageRecord {
        self.last_id += 1;
        let record = message.into_record(self.last_id);
        self.messages.push(record.clone());
        record
    }

    fn history(&self, chat_id: Option<i64>, limit: usize) -> Vec<MessageRecord> {
        let mut selected: Vec<&MessageRecord> = self
            .messages
            .iter()
            .filter(|m| chat_id.is_none() || m.chat_id == chat_id)
            .collect();
        selected.sort_by(|a, b| (&b.timestamp, b.id).cmp(&(&a.timestamp, a.id)));
        selected.truncate(limit);
        selected.into_iter().rev().cloned().collect()
    }
}

impl SqliteStore {
    fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER,
                user_id INTEGER NOT NULL,
                text TEXT NOT NULL,
                ts TEXT NOT NULL,
                channel TEXT NOT NULL,
                state_code TEXT NOT NULL,
                sender TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS messages_chat_ts ON messages(chat_id, ts);
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self { conn })
    }

    fn append(&mut self, message: NewMessage) -> Result<MessageRecord, String> {
        insert_message(&self.conn, message)
    }

    fn append_exchange(
        &mut self,
        user: NewMessage,
        assistant: NewMessage,
    ) -> Result<(MessageRecord, MessageRecord), String> {
        let tx = self.conn.transaction().map_err(|e| e.to_string())?;
        let user = insert_message(&tx, user)?;
        let assistant = insert_message(&tx, assistant)?;
        tx.commit().map_err(|e| e.to_string())?;
        Ok((user, assistant))
    }

    fn history(&self, chat_id: Option<i64>, limit: usize) -> Result<Vec<MessageRecord>, String> {
        let mut stmt = self
            .conn
            .prepare(
                "
                SELECT id, chat_id, user_id, text, ts, channel, state_code, sender
                FROM messages
                WHERE (?1 IS NULL OR chat_id = ?1)
                ORDER BY ts DESC, id DESC
                LIMIT ?2
                ",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![chat_id, limit as i64], message_from_row)
            .map_err(|e| e.to_string())?;
        let mut messages = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;
        messages.reverse();
        Ok(messages)
    }

    fn get(&self, id: i64) -> Result<Option<MessageRecord>, String> {
        self.conn
            .query_row(
                "SELECT id, chat_id, user_id, text, ts, channel, state_code, sender FROM messages WHERE id = ?1",
                params![id],
                message_from_row,
            )
            .optional()
            .map_err(|e| e.to_string())
    }
}

fn insert_message(conn: &Connection, message: NewMessage) -> Result<MessageRecord, String> {
    conn.execute(
        "
        INSERT INTO messages (chat_id, user_id, text, ts, channel, state_code, sender)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ",
        params![
            message.chat_id,
            message.user_id,
            message.text,
            format_ts(message.timestamp),
            message.channel.as_str(),
            message.state_code,
            message.sender.as_str()
        ],
    )
    .map_err(|e| e.to_string())?;
    Ok(message.into_record(conn.last_insert_rowid()))
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        user_id: row.get(2)?,
        text: row.get(3)?,
        timestamp: row.get(4)?,
        channel: match row.get::<_, String>(5)?.as_str() {
            "audio" => Channel::Audio,
            _ => Channel::Text,
        },
        state_code: row.get(6)?,
        sender: match row.get::<_, String>(7)?.as_str() {
            "assistant" => Sender::Assistant,
            _ => Sender::User,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn message(chat_id: Option<i64>, text: &str, ts: DateTime<Utc>, sender: Sender) -> NewMessage {
        NewMessage {
            chat_id,
            user_id: 1,
            text: text.to_string(),
            timestamp: ts,
            channel: Channel::Text,
            state_code: "000".to_string(),
            sender,
        }
    }

    fn sqlite_store() -> StoreBackend {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("bankchat-store-{nanos}.db"));
        StoreBackend::open(&Store {
            kind: "sqlite".to_string(),
            sqlite_path: Some(path.to_string_lossy().to_string()),
        })
        .unwrap()
    }

    fn fill(store: &mut StoreBackend) {
        let base = Utc::now();
        for i in 0..4 {
            let at = base + Duration::seconds(i * 10);
            store
                .append_exchange(
                    message(Some(1 + i % 2), &format!("q{i}"), at, Sender::User),
                    message(Some(1 + i % 2), &format!("a{i}"), at + Duration::seconds(1), Sender::Assistant),
                )
                .unwrap();
        }
    }

    fn texts(messages: &[MessageRecord]) -> Vec<&str> {
        messages.iter().map(|m| m.text.as_str()).collect()
    }

    #[test]
    fn history_returns_latest_window_oldest_first() {
        for mut store in [StoreBackend::Memory(MemoryStore::default()), sqlite_store()] {
            fill(&mut store);
            assert_eq!(texts(&store.history(None, 3).unwrap()), vec!["a2", "q3", "a3"]);
            assert_eq!(
                texts(&store.history(Some(1), 10).unwrap()),
                vec!["q0", "a0", "q2", "a2"]
            );
            assert!(store.history(Some(9), 10).unwrap().is_empty());
        }
    }

    #[test]
    fn exchange_ids_are_consecutive_and_fetchable() {
        for mut store in [StoreBackend::Memory(MemoryStore::default()), sqlite_store()] {
            let now = Utc::now();
            let (user, assistant) = store
                .append_exchange(
                    message(None, "привет", now, Sender::User),
                    message(None, "здравствуйте", now, Sender::Assistant),
                )
                .unwrap();
            assert_eq!(assistant.id, user.id + 1);
            assert_eq!(store.get(user.id).unwrap(), Some(user.clone()));
            assert_eq!(store.get(assistant.id).unwrap().unwrap().sender, Sender::Assistant);
            assert!(store.get(assistant.id + 100).unwrap().is_none());
        }
    }

    #[test]
    fn single_append_is_visible_in_history() {
        let mut store = sqlite_store();
        let record = store
            .append(message(Some(3), "одно", Utc::now(), Sender::User))
            .unwrap();
        assert_eq!(store.history(Some(3), 5).unwrap(), vec![record]);
    }

    #[test]
    fn failed_exchange_leaves_no_partial_pair() {
        let mut store = sqlite_store();
        if let StoreBackend::Sqlite(inner) = &store {
            inner
                .conn
                .execute_batch(
                    "CREATE TRIGGER reject_assistant BEFORE INSERT ON messages
                     WHEN NEW.sender = 'assistant'
                     BEGIN SELECT RAISE(ABORT, 'assistant rejected'); END;",
                )
                .unwrap();
        }
        let now = Utc::now();
        let err = store
            .append_exchange(
                message(None, "q", now, Sender::User),
                message(None, "a", now, Sender::Assistant),
            )
            .unwrap_err();
        assert!(err.contains("assistant rejected"));
        assert!(store.history(None, 10).unwrap().is_empty());
    }
}
