//! Database row types. These map directly to SQLite rows and stay separate
//! from the bellatrix-types wire models.

use bellatrix_types::models::{ChatMessage, PhotoEntry, profile_pic_or_default};
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;

pub struct UserRow {
    pub id: i64,
    pub couple_id: i64,
    pub username: String,
    pub password: String,
    pub profile_pic: Option<String>,
}

/// A message joined with its sender.
pub struct MessageRow {
    pub id: i64,
    pub couple_id: i64,
    pub sender_user_id: i64,
    pub username: String,
    pub profile_pic: Option<String>,
    pub message_text: String,
    pub created_at: String,
}

pub struct PhotoRow {
    pub id: i64,
    pub couple_id: i64,
    pub image_path: String,
    pub caption: String,
    pub uploaded_by_user_id: i64,
}

/// A photo annotated with its like count and the viewer's like state.
pub struct PhotoListRow {
    pub id: i64,
    pub image_path: String,
    pub caption: String,
    pub uploaded_by: String,
    pub like_count: i64,
    pub viewer_liked: bool,
}

/// Outcome of a successful registration.
#[derive(Debug)]
pub struct Registration {
    pub user_id: i64,
    pub couple_id: i64,
    /// Set only when a new couple was created.
    pub invite_code: Option<String>,
}

impl From<MessageRow> for ChatMessage {
    fn from(row: MessageRow) -> Self {
        let created_at = parse_timestamp(&row.created_at).unwrap_or_else(|| {
            warn!("Corrupt created_at '{}' on message {}", row.created_at, row.id);
            DateTime::default()
        });

        ChatMessage {
            id: row.id,
            username: row.username,
            message_text: row.message_text,
            profile_pic: profile_pic_or_default(row.profile_pic),
            created_at,
        }
    }
}

impl From<PhotoListRow> for PhotoEntry {
    fn from(row: PhotoListRow) -> Self {
        PhotoEntry {
            id: row.id,
            image_path: row.image_path,
            caption: row.caption,
            uploaded_by: row.uploaded_by,
            like_count: row.like_count,
            user_has_liked: row.viewer_liked,
        }
    }
}

/// Stored timestamps are RFC 3339; rows written by hand in the sqlite shell
/// may carry SQLite's own "YYYY-MM-DD HH:MM:SS" format, read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>().ok().or_else(|| {
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
            .ok()
            .map(|ndt| ndt.and_utc())
    })
}

/// The canonical stored form of a timestamp.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
