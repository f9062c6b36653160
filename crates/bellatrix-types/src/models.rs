use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Avatar used whenever a user registered without a profile picture.
pub const DEFAULT_PROFILE_PIC: &str = "data:image/svg+xml,<svg xmlns=%22http://www.w3.org/2000/svg%22 viewBox=%220 0 100 100%22><text y=%22.9em%22 font-size=%2290%22>👤</text></svg>";

/// A chat message as delivered to clients: the stored row joined with the
/// sender's username and profile picture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub username: String,
    pub message_text: String,
    pub profile_pic: String,
    pub created_at: DateTime<Utc>,
}

/// One tile of the photo wall, annotated for the requesting user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoEntry {
    pub id: i64,
    pub image_path: String,
    pub caption: String,
    pub uploaded_by: String,
    pub like_count: i64,
    pub user_has_liked: bool,
}

/// Falls back to the placeholder avatar for users without a stored picture.
pub fn profile_pic_or_default(profile_pic: Option<String>) -> String {
    profile_pic
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_PROFILE_PIC.to_string())
}
