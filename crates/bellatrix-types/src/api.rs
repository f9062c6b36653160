use serde::{Deserialize, Serialize};

// -- JWT Claims --

/// JWT claims shared by bellatrix-api (issued at login) and bellatrix-gateway
/// (checked at websocket upgrade).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub username: String,
    pub couple_id: i64,
    pub exp: usize,
}

// -- Auth --

/// Text fields of the multipart registration form. The profile picture
/// travels as a file part and is handled separately.
#[derive(Debug, Default)]
pub struct RegisterForm {
    pub username: String,
    pub password: String,
    pub invite_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub message: String,
    #[serde(rename = "inviteCode", skip_serializing_if = "Option::is_none")]
    pub invite_code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub username: String,
    #[serde(rename = "coupleId")]
    pub couple_id: i64,
    pub profile_pic: String,
    pub token: String,
    /// Lets the first partner look the code up again after registering.
    #[serde(rename = "inviteCode", skip_serializing_if = "Option::is_none")]
    pub invite_code: Option<String>,
}

// -- Photos --

#[derive(Debug, Deserialize)]
pub struct PhotoListQuery {
    pub username: Option<String>,
}

/// Body of the like and delete endpoints: the acting user.
#[derive(Debug, Deserialize)]
pub struct UsernameBody {
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LikeResponse {
    pub success: bool,
    #[serde(rename = "newLikeCount")]
    pub new_like_count: i64,
}

/// Generic `{success, message}` envelope used by mutations and by every
/// error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub success: bool,
    pub message: String,
}

impl StatusResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}
