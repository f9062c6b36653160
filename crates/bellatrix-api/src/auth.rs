use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{
    Json,
    extract::{Multipart, State},
    http::StatusCode,
    response::IntoResponse,
};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::{info, warn};

use bellatrix_types::api::{Claims, LoginRequest, LoginResponse, RegisterForm, RegisterResponse};
use bellatrix_types::models::profile_pic_or_default;

use crate::error::ApiError;
use crate::form::FormData;
use crate::storage::{allowed_image_types, image_extension};
use crate::{AppState, invite, run_db};

const USERNAME_LEN: std::ops::RangeInclusive<usize> = 3..=32;
const TOKEN_LIFETIME_DAYS: i64 = 30;

/// POST /api/register: multipart `{username, password, profilePic?, inviteCode?}`.
pub async fn register(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut form = FormData::read(multipart).await?;

    let req = RegisterForm {
        username: form.text("username").unwrap_or_default().to_string(),
        password: form.raw("password").unwrap_or_default().to_string(),
        invite_code: form.text("inviteCode").map(str::to_string),
    };

    // Validate input
    if !USERNAME_LEN.contains(&req.username.chars().count()) {
        return Err(ApiError::bad_request(format!(
            "Username must be between {} and {} characters.",
            USERNAME_LEN.start(),
            USERNAME_LEN.end()
        )));
    }
    if req.password.is_empty() {
        return Err(ApiError::bad_request("Password is required."));
    }

    let profile_pic = match form.take_file("profilePic") {
        Some(file) => {
            let ext = image_extension(&file.content_type).ok_or_else(|| {
                ApiError::bad_request(format!(
                    "Profile picture must be one of: {}",
                    allowed_image_types()
                ))
            })?;
            Some(state.storage.save(ext, &file.data).await?)
        }
        None => None,
    };

    let username = req.username.clone();
    let pic = profile_pic.clone();
    let result = run_db(&state, move |db| {
        let password_hash = hash_password(&req.password)?;
        db.register_user(
            &req.username,
            &password_hash,
            pic.as_deref(),
            req.invite_code.as_deref(),
            invite::generate,
        )
    })
    .await;

    let registration = match result {
        Ok(registration) => registration,
        Err(e) => {
            // Don't leave an orphaned avatar behind
            if let Some(path) = &profile_pic {
                if let Err(del) = state.storage.delete(path).await {
                    warn!("Failed to remove avatar {} after failed registration: {}", path, del);
                }
            }
            return Err(e);
        }
    };

    info!(
        "Registered {} (user {}, couple {})",
        username, registration.user_id, registration.couple_id
    );

    let message = match &registration.invite_code {
        Some(code) => format!(
            "Couple profile created! Share your invite code with your love: {}",
            code
        ),
        None => "You joined your couple's profile!".to_string(),
    };

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            success: true,
            message,
            invite_code: registration.invite_code,
        }),
    ))
}

/// POST /api/login
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let invalid = || ApiError::Unauthorized("Invalid username or password.".into());

    let username = req.username.trim().to_string();
    let user = run_db(&state, move |db| db.get_user_by_username(&username))
        .await?
        .ok_or_else(invalid)?;

    let parsed_hash = PasswordHash::new(&user.password)
        .map_err(|e| anyhow::anyhow!("corrupt password hash for user {}: {}", user.id, e))?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| invalid())?;

    let token = create_token(&state.jwt_secret, user.id, &user.username, user.couple_id)?;

    let couple_id = user.couple_id;
    let invite_code = run_db(&state, move |db| db.get_invite_code(couple_id)).await?;

    info!("{} logged in (couple {})", user.username, user.couple_id);

    Ok(Json(LoginResponse {
        success: true,
        username: user.username,
        couple_id: user.couple_id,
        profile_pic: profile_pic_or_default(user.profile_pic),
        token,
        invite_code,
    }))
}

fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?;
    Ok(hash.to_string())
}

pub fn create_token(secret: &str, user_id: i64, username: &str, couple_id: i64) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        couple_id,
        exp: (chrono::Utc::now() + chrono::Duration::days(TOKEN_LIFETIME_DAYS)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

/// Validate a token issued by [`create_token`].
pub fn decode_token(secret: &str, token: &str) -> anyhow::Result<Claims> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(data.claims)
}
