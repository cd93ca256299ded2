use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};
use crate::principal::{Principal, PrincipalKind};

/// Display-safe view of a chat participant or message sender.
/// Never carries credentials, only the fields list views need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub email: String,
    pub kind: PrincipalKind,
}

impl From<&Principal> for Participant {
    fn from(p: &Principal) -> Self {
        Self {
            id: p.id.clone(),
            name: p.name.clone(),
            email: p.email.clone(),
            kind: p.kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    Active,
    Archived,
}

impl ChatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatStatus::Active => "active",
            ChatStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> ChatResult<Self> {
        match s {
            "active" => Ok(ChatStatus::Active),
            "archived" => Ok(ChatStatus::Archived),
            other => Err(ChatError::Internal(format!("unknown chat status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Guidance,
    Resource,
    Feedback,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Guidance => "guidance",
            MessageType::Resource => "resource",
            MessageType::Feedback => "feedback",
        }
    }

    pub fn parse(s: &str) -> ChatResult<Self> {
        match s {
            "text" => Ok(MessageType::Text),
            "guidance" => Ok(MessageType::Guidance),
            "resource" => Ok(MessageType::Resource),
            "feedback" => Ok(MessageType::Feedback),
            other => Err(ChatError::Internal(format!("unknown message type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    Academic,
    Skill,
    Career,
    General,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// Optional structured payload attached to a message. Which fields are
/// required depends on the message type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback_type: Option<FeedbackType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl MessageMetadata {
    /// Check the metadata against the declared message type and fill
    /// defaults. Resource messages must carry a URL, feedback messages a
    /// feedback type; feedback priority defaults to medium.
    pub fn validated(
        metadata: Option<MessageMetadata>,
        message_type: MessageType,
    ) -> ChatResult<Option<MessageMetadata>> {
        match message_type {
            MessageType::Resource => {
                let mut meta = metadata.ok_or_else(|| {
                    ChatError::InvalidInput("resource messages require metadata".into())
                })?;
                if meta.resource_url.as_deref().map_or(true, str::is_empty) {
                    return Err(ChatError::InvalidInput(
                        "resource messages require a resource_url".into(),
                    ));
                }
                meta.feedback_type = None;
                meta.priority = None;
                Ok(Some(meta))
            }
            MessageType::Feedback => {
                let mut meta = metadata.ok_or_else(|| {
                    ChatError::InvalidInput("feedback messages require metadata".into())
                })?;
                if meta.feedback_type.is_none() {
                    return Err(ChatError::InvalidInput(
                        "feedback messages require a feedback_type".into(),
                    ));
                }
                meta.priority.get_or_insert(Priority::Medium);
                meta.resource_url = None;
                meta.resource_type = None;
                Ok(Some(meta))
            }
            // Plain and guidance messages carry no structured payload.
            MessageType::Text | MessageType::Guidance => Ok(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    /// Position within the chat, assigned by the store at append time.
    pub seq: i64,
    pub sender: Participant,
    pub content: String,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    /// Ids of principals who have seen this message. Grows, never shrinks.
    pub read_by: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Progress {
    #[default]
    NotStarted,
    InProgress,
    Completed,
}

impl Progress {
    pub fn as_str(&self) -> &'static str {
        match self {
            Progress::NotStarted => "not_started",
            Progress::InProgress => "in_progress",
            Progress::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> ChatResult<Self> {
        match s {
            "not_started" => Ok(Progress::NotStarted),
            "in_progress" => Ok(Progress::InProgress),
            "completed" => Ok(Progress::Completed),
            other => Err(ChatError::Internal(format!("unknown progress: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingNote {
    pub date: DateTime<Utc>,
    pub notes: String,
    #[serde(default)]
    pub action_items: Vec<String>,
}

/// Structured mentorship state attached to a chat, separate from the
/// message log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MentorshipDetails {
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub progress: Progress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_meeting_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub meeting_notes: Vec<MeetingNote>,
}

/// Partial update for mentorship details. Absent fields are left alone;
/// a submitted note is appended to the existing list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MentorshipUpdate {
    pub goals: Option<Vec<String>>,
    pub progress: Option<Progress>,
    pub next_meeting_date: Option<DateTime<Utc>>,
    pub add_meeting_note: Option<MeetingNote>,
}

/// One persistent mentorship conversation between a student and a TPO
/// staff member. The participant pair is fixed for the chat's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub student: Participant,
    pub tpo: Participant,
    pub status: ChatStatus,
    pub mentorship: MentorshipDetails,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
