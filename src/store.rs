use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Row, SqlitePool};
use uuid::Uuid;

use crate::chat::{
    Chat, ChatStatus, MeetingNote, MentorshipDetails, MentorshipUpdate, Message, MessageMetadata,
    MessageType, Participant, Progress,
};
use crate::error::{ChatError, ChatResult};
use crate::principal::{Principal, PrincipalKind};

/// Shared SELECT for a chat joined with both participants' display fields.
const CHAT_SELECT: &str = r#"
    SELECT c.id, c.status, c.goals, c.progress, c.next_meeting_date, c.meeting_notes,
           c.last_message_id, c.created_at, c.updated_at,
           s.id AS student_id, s.name AS student_name, s.email AS student_email,
           t.id AS tpo_id, t.name AS tpo_name, t.email AS tpo_email
    FROM chats c
    JOIN principals s ON s.id = c.student
    JOIN principals t ON t.id = c.tpo
"#;

/// Single source of truth for chats, messages and read receipts.
///
/// All mutation goes through atomic operations here; the pair-uniqueness
/// and append invariants are enforced by the schema, not by callers.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Create a new Store instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> ChatResult<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ChatError::Internal(format!("failed to create database directory: {e}"))
                })?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(ChatError::Database)?
            .create_if_missing(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options).await?;

        Ok(Self { pool })
    }

    /// In-memory store, used by the integration tests. Pinned to a single
    /// connection because every pooled connection to `:memory:` would get
    /// its own empty database.
    pub async fn in_memory() -> ChatResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(ChatError::Database)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> ChatResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS principals (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                role TEXT NOT NULL,
                name TEXT NOT NULL,
                email TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                student TEXT NOT NULL REFERENCES principals(id),
                tpo TEXT NOT NULL REFERENCES principals(id),
                status TEXT NOT NULL DEFAULT 'active',
                goals TEXT NOT NULL DEFAULT '[]',
                progress TEXT NOT NULL DEFAULT 'not_started',
                next_meeting_date DATETIME,
                meeting_notes TEXT NOT NULL DEFAULT '[]',
                last_message_id TEXT,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                UNIQUE(student, tpo)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL REFERENCES chats(id),
                seq INTEGER NOT NULL,
                sender TEXT NOT NULL REFERENCES principals(id),
                content TEXT NOT NULL,
                message_type TEXT NOT NULL DEFAULT 'text',
                metadata TEXT,
                client_key TEXT,
                created_at DATETIME NOT NULL,
                UNIQUE(chat_id, seq),
                UNIQUE(chat_id, client_key)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chat_seq ON messages(chat_id, seq);

            CREATE TABLE IF NOT EXISTS message_reads (
                message_id TEXT NOT NULL REFERENCES messages(id),
                principal_id TEXT NOT NULL,
                PRIMARY KEY (message_id, principal_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---------------------------------------------------------------------
    // Principals
    // ---------------------------------------------------------------------

    pub async fn insert_principal(&self, principal: &Principal) -> ChatResult<()> {
        sqlx::query(
            r#"
            INSERT INTO principals (id, kind, role, name, email)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                role = excluded.role,
                name = excluded.name,
                email = excluded.email
            "#,
        )
        .bind(&principal.id)
        .bind(principal.kind.as_str())
        .bind(&principal.role)
        .bind(&principal.name)
        .bind(&principal.email)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn principal_by_id(&self, id: &str) -> ChatResult<Option<Principal>> {
        let row = sqlx::query("SELECT id, kind, role, name, email FROM principals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(Principal {
                id: row.try_get("id")?,
                kind: PrincipalKind::parse(row.try_get::<String, _>("kind")?.as_str())?,
                role: row.try_get("role")?,
                name: row.try_get("name")?,
                email: row.try_get("email")?,
            })
        })
        .transpose()
    }

    // ---------------------------------------------------------------------
    // Chats
    // ---------------------------------------------------------------------

    /// Create the chat for this student/TPO pair, or return the existing
    /// one. The UNIQUE(student, tpo) constraint serializes concurrent
    /// creation; the loser of the race observes the winner's row.
    ///
    /// Returns the chat and whether it was newly created.
    pub async fn create_or_get(
        &self,
        requester: &Principal,
        counterpart_id: &str,
    ) -> ChatResult<(Chat, bool)> {
        let counterpart = self
            .principal_by_id(counterpart_id)
            .await?
            .ok_or_else(|| ChatError::NotFound("counterpart".into()))?;

        // Normalize the pair regardless of which side called.
        let (student, tpo) = match (requester.kind, counterpart.kind) {
            (PrincipalKind::Student, PrincipalKind::TpoStaff) => {
                (requester.id.as_str(), counterpart.id.as_str())
            }
            (PrincipalKind::TpoStaff, PrincipalKind::Student) => {
                (counterpart.id.as_str(), requester.id.as_str())
            }
            (a, b) => {
                return Err(ChatError::InvalidPair(format!(
                    "chat requires one student and one TPO staff, got {} and {}",
                    a.as_str(),
                    b.as_str()
                )))
            }
        };

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO chats (id, student, tpo, status, created_at, updated_at)
            VALUES (?, ?, ?, 'active', ?, ?)
            ON CONFLICT(student, tpo) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(student)
        .bind(tpo)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() == 1;

        let row = sqlx::query(&format!("{CHAT_SELECT} WHERE c.student = ? AND c.tpo = ?"))
            .bind(student)
            .bind(tpo)
            .fetch_one(&self.pool)
            .await?;
        let chat = self.chat_from_row(&row).await?;

        Ok((chat, created))
    }

    pub async fn chat_by_id(&self, chat_id: &str) -> ChatResult<Option<Chat>> {
        let row = sqlx::query(&format!("{CHAT_SELECT} WHERE c.id = ?"))
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.chat_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    /// All chats the principal participates in, most recently updated
    /// first, enriched with participant display fields and last message.
    pub async fn list_for(&self, principal: &Principal) -> ChatResult<Vec<Chat>> {
        let rows = sqlx::query(&format!(
            "{CHAT_SELECT} WHERE c.student = ? OR c.tpo = ? ORDER BY c.updated_at DESC"
        ))
        .bind(&principal.id)
        .bind(&principal.id)
        .fetch_all(&self.pool)
        .await?;

        let mut chats = Vec::with_capacity(rows.len());
        for row in &rows {
            chats.push(self.chat_from_row(row).await?);
        }
        Ok(chats)
    }

    /// The (student, tpo) ids of a chat, or `NotFound`.
    async fn participants_of(&self, chat_id: &str) -> ChatResult<(String, String)> {
        let row = sqlx::query("SELECT student, tpo FROM chats WHERE id = ?")
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ChatError::NotFound("chat".into()))?;

        Ok((row.try_get("student")?, row.try_get("tpo")?))
    }

    /// Whether the principal is one of the chat's two participants.
    /// A missing chat answers false; the gateway uses this to gate room
    /// joins without leaking chat existence.
    pub async fn is_participant(&self, chat_id: &str, principal_id: &str) -> ChatResult<bool> {
        match self.participants_of(chat_id).await {
            Ok((student, tpo)) => Ok(student == principal_id || tpo == principal_id),
            Err(ChatError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Explicit status transition. The trigger for archiving lives outside
    /// this subsystem; there is no delete path.
    pub async fn set_status(&self, chat_id: &str, status: ChatStatus) -> ChatResult<()> {
        let result = sqlx::query("UPDATE chats SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(chat_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ChatError::NotFound("chat".into()));
        }
        Ok(())
    }

    /// Apply a partial mentorship update. Goals, progress and next meeting
    /// replace the stored values when present; a meeting note appends.
    pub async fn update_mentorship(
        &self,
        chat_id: &str,
        principal: &Principal,
        update: MentorshipUpdate,
    ) -> ChatResult<Chat> {
        let (student, tpo) = self.participants_of(chat_id).await?;
        if principal.id != student && principal.id != tpo {
            return Err(ChatError::Forbidden(
                "not a participant in this chat".into(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT goals, progress, next_meeting_date, meeting_notes FROM chats WHERE id = ?",
        )
        .bind(chat_id)
        .fetch_one(&mut *tx)
        .await?;

        let mut details = mentorship_from_row(&row)?;
        if let Some(goals) = update.goals {
            details.goals = goals;
        }
        if let Some(progress) = update.progress {
            details.progress = progress;
        }
        if let Some(date) = update.next_meeting_date {
            details.next_meeting_date = Some(date);
        }
        if let Some(note) = update.add_meeting_note {
            details.meeting_notes.push(note);
        }

        sqlx::query(
            r#"
            UPDATE chats
            SET goals = ?, progress = ?, next_meeting_date = ?, meeting_notes = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(serde_json::to_string(&details.goals)?)
        .bind(details.progress.as_str())
        .bind(details.next_meeting_date)
        .bind(serde_json::to_string(&details.meeting_notes)?)
        .bind(Utc::now())
        .bind(chat_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.chat_by_id(chat_id)
            .await?
            .ok_or_else(|| ChatError::NotFound("chat".into()))
    }

    // ---------------------------------------------------------------------
    // Messages
    // ---------------------------------------------------------------------

    /// Append a message to a chat in one transaction: sequence assignment,
    /// read-receipt seed, and the chat's last-message/updated-at bump all
    /// commit together, so concurrent senders cannot lose each other's
    /// appends.
    ///
    /// A retried append carrying the same `client_key` returns the
    /// already-stored message instead of creating a duplicate.
    pub async fn append_message(
        &self,
        chat_id: &str,
        sender: &Principal,
        content: &str,
        message_type: MessageType,
        metadata: Option<MessageMetadata>,
        client_key: Option<&str>,
    ) -> ChatResult<Message> {
        if content.trim().is_empty() {
            return Err(ChatError::InvalidInput("message content is required".into()));
        }
        let metadata = MessageMetadata::validated(metadata, message_type)?;

        let (student, tpo) = self.participants_of(chat_id).await?;
        if sender.id != student && sender.id != tpo {
            return Err(ChatError::Forbidden(
                "not authorized to send messages in this chat".into(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        if let Some(key) = client_key {
            let existing =
                sqlx::query("SELECT id FROM messages WHERE chat_id = ? AND client_key = ?")
                    .bind(chat_id)
                    .bind(key)
                    .fetch_optional(&mut *tx)
                    .await?;
            if let Some(row) = existing {
                let id: String = row.try_get("id")?;
                drop(tx);
                return self
                    .message_by_id(&id)
                    .await?
                    .ok_or_else(|| ChatError::NotFound("message".into()));
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let metadata_json = metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO messages (id, chat_id, seq, sender, content, message_type, metadata, client_key, created_at)
            VALUES (?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE chat_id = ?), ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(chat_id)
        .bind(chat_id)
        .bind(&sender.id)
        .bind(content)
        .bind(message_type.as_str())
        .bind(metadata_json.as_deref())
        .bind(client_key)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // The sender has trivially seen their own message.
        sqlx::query("INSERT INTO message_reads (message_id, principal_id) VALUES (?, ?)")
            .bind(&id)
            .bind(&sender.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE chats SET last_message_id = ?, updated_at = ? WHERE id = ?")
            .bind(&id)
            .bind(now)
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;

        let seq: i64 = sqlx::query("SELECT seq FROM messages WHERE id = ?")
            .bind(&id)
            .fetch_one(&mut *tx)
            .await?
            .try_get("seq")?;

        tx.commit().await?;

        Ok(Message {
            id,
            chat_id: chat_id.to_string(),
            seq,
            sender: Participant::from(sender),
            content: content.to_string(),
            message_type,
            metadata,
            read_by: vec![sender.id.clone()],
            created_at: now,
        })
    }

    /// Ordered message log of a chat, restricted to its participants.
    pub async fn messages_for(
        &self,
        chat_id: &str,
        principal: &Principal,
    ) -> ChatResult<Vec<Message>> {
        let (student, tpo) = self.participants_of(chat_id).await?;
        if principal.id != student && principal.id != tpo {
            return Err(ChatError::Forbidden(
                "not authorized to view this chat".into(),
            ));
        }

        let rows = sqlx::query(
            r#"
            SELECT m.id, m.chat_id, m.seq, m.content, m.message_type, m.metadata, m.created_at,
                   p.id AS sender_id, p.name AS sender_name, p.email AS sender_email, p.kind AS sender_kind
            FROM messages m
            JOIN principals p ON p.id = m.sender
            WHERE m.chat_id = ?
            ORDER BY m.seq ASC
            "#,
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;

        let mut read_map = self.read_map_for_chat(chat_id).await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("id")?;
            let read_by = read_map.remove(&id).unwrap_or_default();
            messages.push(message_from_row(row, read_by)?);
        }
        Ok(messages)
    }

    async fn message_by_id(&self, message_id: &str) -> ChatResult<Option<Message>> {
        let row = sqlx::query(
            r#"
            SELECT m.id, m.chat_id, m.seq, m.content, m.message_type, m.metadata, m.created_at,
                   p.id AS sender_id, p.name AS sender_name, p.email AS sender_email, p.kind AS sender_kind
            FROM messages m
            JOIN principals p ON p.id = m.sender
            WHERE m.id = ?
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };

        let reads = sqlx::query("SELECT principal_id FROM message_reads WHERE message_id = ?")
            .bind(message_id)
            .fetch_all(&self.pool)
            .await?;
        let read_by = reads
            .iter()
            .map(|r| r.try_get("principal_id"))
            .collect::<Result<Vec<String>, _>>()?;

        Ok(Some(message_from_row(&row, read_by)?))
    }

    /// Add the principal to the read set of every message in the chat.
    /// INSERT OR IGNORE makes this idempotent and the set monotone.
    pub async fn mark_read(&self, chat_id: &str, principal: &Principal) -> ChatResult<()> {
        let (student, tpo) = self.participants_of(chat_id).await?;
        if principal.id != student && principal.id != tpo {
            return Err(ChatError::Forbidden(
                "not authorized to view this chat".into(),
            ));
        }

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO message_reads (message_id, principal_id)
            SELECT id, ? FROM messages WHERE chat_id = ?
            "#,
        )
        .bind(&principal.id)
        .bind(chat_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---------------------------------------------------------------------
    // Row mapping
    // ---------------------------------------------------------------------

    async fn read_map_for_chat(
        &self,
        chat_id: &str,
    ) -> ChatResult<HashMap<String, Vec<String>>> {
        let rows = sqlx::query(
            r#"
            SELECT r.message_id, r.principal_id
            FROM message_reads r
            JOIN messages m ON m.id = r.message_id
            WHERE m.chat_id = ?
            "#,
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;

        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for row in &rows {
            let message_id: String = row.try_get("message_id")?;
            let principal_id: String = row.try_get("principal_id")?;
            map.entry(message_id).or_default().push(principal_id);
        }
        Ok(map)
    }

    async fn chat_from_row(&self, row: &SqliteRow) -> ChatResult<Chat> {
        let last_message_id: Option<String> = row.try_get("last_message_id")?;
        let last_message = match last_message_id {
            Some(id) => self.message_by_id(&id).await?,
            None => None,
        };

        Ok(Chat {
            id: row.try_get("id")?,
            student: Participant {
                id: row.try_get("student_id")?,
                name: row.try_get("student_name")?,
                email: row.try_get("student_email")?,
                kind: PrincipalKind::Student,
            },
            tpo: Participant {
                id: row.try_get("tpo_id")?,
                name: row.try_get("tpo_name")?,
                email: row.try_get("tpo_email")?,
                kind: PrincipalKind::TpoStaff,
            },
            status: ChatStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
            mentorship: mentorship_from_row(row)?,
            last_message,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn mentorship_from_row(row: &SqliteRow) -> ChatResult<MentorshipDetails> {
    let goals: Vec<String> = serde_json::from_str(row.try_get::<String, _>("goals")?.as_str())?;
    let meeting_notes: Vec<MeetingNote> =
        serde_json::from_str(row.try_get::<String, _>("meeting_notes")?.as_str())?;

    Ok(MentorshipDetails {
        goals,
        progress: Progress::parse(row.try_get::<String, _>("progress")?.as_str())?,
        next_meeting_date: row.try_get::<Option<DateTime<Utc>>, _>("next_meeting_date")?,
        meeting_notes,
    })
}

fn message_from_row(row: &SqliteRow, read_by: Vec<String>) -> ChatResult<Message> {
    let metadata: Option<MessageMetadata> = row
        .try_get::<Option<String>, _>("metadata")?
        .map(|json| serde_json::from_str(&json))
        .transpose()?;

    Ok(Message {
        id: row.try_get("id")?,
        chat_id: row.try_get("chat_id")?,
        seq: row.try_get("seq")?,
        sender: Participant {
            id: row.try_get("sender_id")?,
            name: row.try_get("sender_name")?,
            email: row.try_get("sender_email")?,
            kind: PrincipalKind::parse(row.try_get::<String, _>("sender_kind")?.as_str())?,
        },
        content: row.try_get("content")?,
        message_type: MessageType::parse(row.try_get::<String, _>("message_type")?.as_str())?,
        metadata,
        read_by,
        created_at: row.try_get("created_at")?,
    })
}
