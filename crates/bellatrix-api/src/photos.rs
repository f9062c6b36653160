use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{info, warn};

use bellatrix_db::models::UserRow;
use bellatrix_types::api::{LikeResponse, PhotoListQuery, StatusResponse, UsernameBody};
use bellatrix_types::models::PhotoEntry;

use crate::error::ApiError;
use crate::form::FormData;
use crate::storage::{allowed_image_types, image_extension};
use crate::{AppState, run_db};

/// GET /api/photos/{couple_id}?username=: the whole wall, newest first.
pub async fn list_photos(
    State(state): State<AppState>,
    Path(couple_id): Path<i64>,
    Query(query): Query<PhotoListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let viewer = query
        .username
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty());

    let photos = run_db(&state, move |db| {
        let viewer_id = match viewer {
            Some(name) => db.get_user_by_username(&name)?.map(|u| u.id),
            None => None,
        };
        db.list_photos(couple_id, viewer_id)
    })
    .await?;

    let photos: Vec<PhotoEntry> = photos.into_iter().map(PhotoEntry::from).collect();
    Ok(Json(photos))
}

/// POST /api/photos/{couple_id}: multipart `{photo, caption, username}`.
pub async fn upload_photo(
    State(state): State<AppState>,
    Path(couple_id): Path<i64>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut form = FormData::read(multipart).await?;

    let photo = form
        .take_file("photo")
        .ok_or_else(|| ApiError::bad_request("No image uploaded."))?;
    let ext = image_extension(&photo.content_type).ok_or_else(|| {
        ApiError::bad_request(format!("Photo must be one of: {}", allowed_image_types()))
    })?;
    let caption = form.text("caption").unwrap_or_default().to_string();
    let username = form.text("username").unwrap_or_default().to_string();

    let uploader = resolve_user(&state, username).await?;
    if uploader.couple_id != couple_id {
        return Err(ApiError::forbidden("You can only post to your own wall."));
    }

    let image_path = state.storage.save(ext, &photo.data).await?;

    let path = image_path.clone();
    let inserted = run_db(&state, move |db| {
        db.insert_photo(couple_id, &path, &caption, uploader.id)
    })
    .await;

    let photo_id = match inserted {
        Ok(id) => id,
        Err(e) => {
            if let Err(del) = state.storage.delete(&image_path).await {
                warn!("Failed to remove {} after failed insert: {}", image_path, del);
            }
            return Err(e);
        }
    };

    info!("Photo {} added to couple {} by {}", photo_id, couple_id, uploader.username);

    Ok((StatusCode::CREATED, Json(StatusResponse::ok("Photo added!"))))
}

/// POST /api/photos/{photo_id}/like: toggles the caller's like.
pub async fn toggle_like(
    State(state): State<AppState>,
    Path(photo_id): Path<i64>,
    Json(body): Json<UsernameBody>,
) -> Result<impl IntoResponse, ApiError> {
    let username = required_username(body)?;
    let user = resolve_user(&state, username).await?;

    let photo = run_db(&state, move |db| db.get_photo(photo_id))
        .await?
        .ok_or_else(|| ApiError::not_found("Photo not found."))?;
    if photo.couple_id != user.couple_id {
        return Err(ApiError::forbidden("You can only like photos on your own wall."));
    }

    let user_id = user.id;
    let (_liked, count) = run_db(&state, move |db| db.toggle_like(photo_id, user_id)).await?;

    Ok(Json(LikeResponse {
        success: true,
        new_like_count: count,
    }))
}

/// DELETE /api/photos/{photo_id}: only the uploader may delete.
pub async fn delete_photo(
    State(state): State<AppState>,
    Path(photo_id): Path<i64>,
    Json(body): Json<UsernameBody>,
) -> Result<impl IntoResponse, ApiError> {
    let username = required_username(body)?;
    let requester = resolve_user(&state, username).await?;

    let photo = run_db(&state, move |db| db.get_photo(photo_id))
        .await?
        .ok_or_else(|| ApiError::not_found("Photo not found."))?;

    if photo.uploaded_by_user_id != requester.id {
        return Err(ApiError::forbidden(
            "You don't have permission to delete this photo.",
        ));
    }

    run_db(&state, move |db| db.delete_photo(photo_id)).await?;

    // The row is gone either way; a leftover file only costs disk space
    if let Err(e) = state.storage.delete(&photo.image_path).await {
        warn!("Failed to remove image of deleted photo {}: {}", photo_id, e);
    }

    info!("Photo {} deleted by {}", photo_id, requester.username);

    Ok(Json(StatusResponse::ok("Photo deleted.")))
}

fn required_username(body: UsernameBody) -> Result<String, ApiError> {
    body.username
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::bad_request("Username not provided."))
}

/// Look up the acting user; unknown names are an authorization failure.
async fn resolve_user(state: &AppState, username: String) -> Result<UserRow, ApiError> {
    run_db(state, move |db| db.get_user_by_username(&username))
        .await?
        .ok_or_else(|| ApiError::forbidden("Invalid user."))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, header};
    use serde_json::{Value, json};

    use super::*;
    use crate::test_support::{Part, TestApp};

    /// adson and isabella share a couple; returns its id.
    async fn couple(t: &TestApp) -> i64 {
        let first = t.register("adson", None).await;
        t.register("isabella", first["inviteCode"].as_str()).await;
        let (_, login) = t
            .json("POST", "/api/login", json!({"username": "adson", "password": "0209"}))
            .await;
        login["coupleId"].as_i64().unwrap()
    }

    async fn upload(t: &TestApp, couple_id: i64, username: &str, caption: &str) -> StatusCode {
        let (status, _) = t
            .multipart(
                &format!("/api/photos/{}", couple_id),
                &[
                    Part::File {
                        name: "photo",
                        file_name: "beach.jpg",
                        content_type: "image/jpeg",
                        data: b"\xff\xd8\xff fake jpeg",
                    },
                    Part::Text("caption", caption),
                    Part::Text("username", username),
                ],
            )
            .await;
        status
    }

    async fn wall(t: &TestApp, couple_id: i64, username: &str) -> Vec<Value> {
        let (status, body) = t
            .get(&format!("/api/photos/{}?username={}", couple_id, username))
            .await;
        assert_eq!(status, StatusCode::OK);
        body.as_array().unwrap().clone()
    }

    #[tokio::test]
    async fn upload_requires_an_image() {
        let t = TestApp::new("photos-no-image").await;
        let couple_id = couple(&t).await;

        let (status, body) = t
            .multipart(
                &format!("/api/photos/{}", couple_id),
                &[Part::Text("caption", "nada"), Part::Text("username", "adson")],
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = t
            .multipart(
                &format!("/api/photos/{}", couple_id),
                &[
                    Part::File {
                        name: "photo",
                        file_name: "notes.txt",
                        content_type: "text/plain",
                        data: b"hello",
                    },
                    Part::Text("username", "adson"),
                ],
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upload_is_limited_to_members() {
        let t = TestApp::new("photos-members").await;
        let couple_id = couple(&t).await;
        t.register("bruno", None).await;

        assert_eq!(upload(&t, couple_id, "bruno", "intruso").await, StatusCode::FORBIDDEN);
        assert_eq!(upload(&t, couple_id, "ghost", "?").await, StatusCode::FORBIDDEN);
        assert_eq!(upload(&t, couple_id, "adson", "praia").await, StatusCode::CREATED);

        let photos = wall(&t, couple_id, "adson").await;
        assert_eq!(photos.len(), 1);
        assert_eq!(photos[0]["caption"], "praia");
        assert_eq!(photos[0]["uploaded_by"], "adson");
        assert_eq!(photos[0]["like_count"], 0);
        assert_eq!(photos[0]["user_has_liked"], false);
        assert!(photos[0]["image_path"].as_str().unwrap().starts_with("/uploads/"));
    }

    #[tokio::test]
    async fn like_toggle_round_trips_the_count() {
        let t = TestApp::new("photos-like").await;
        let couple_id = couple(&t).await;
        upload(&t, couple_id, "adson", "praia").await;
        let photo_id = wall(&t, couple_id, "adson").await[0]["id"].as_i64().unwrap();
        let like_uri = format!("/api/photos/{}/like", photo_id);

        let (status, body) = t.json("POST", &like_uri, json!({"username": "isabella"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true, "newLikeCount": 1}));

        let photos = wall(&t, couple_id, "isabella").await;
        assert_eq!(photos[0]["user_has_liked"], true);
        let photos = wall(&t, couple_id, "adson").await;
        assert_eq!(photos[0]["user_has_liked"], false);

        let (_, body) = t.json("POST", &like_uri, json!({"username": "isabella"})).await;
        assert_eq!(body["newLikeCount"], 0);

        let (status, _) = t.json("POST", &like_uri, json!({"username": "ghost"})).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = t
            .json("POST", "/api/photos/9999/like", json!({"username": "isabella"}))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn only_the_uploader_can_delete() {
        let t = TestApp::new("photos-delete").await;
        let couple_id = couple(&t).await;
        upload(&t, couple_id, "adson", "praia").await;
        let photo = wall(&t, couple_id, "adson").await[0].clone();
        let photo_id = photo["id"].as_i64().unwrap();
        let file = t
            .upload_dir
            .join(photo["image_path"].as_str().unwrap().trim_start_matches("/uploads/"));
        assert!(file.exists());

        let uri = format!("/api/photos/{}", photo_id);

        let (status, body) = t.json("DELETE", &uri, json!({"username": "isabella"})).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["success"], false);
        assert_eq!(wall(&t, couple_id, "adson").await.len(), 1);

        let (status, body) = t.json("DELETE", &uri, json!({"username": "adson"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert!(wall(&t, couple_id, "adson").await.is_empty());
        assert!(!file.exists());

        let (status, _) = t.json("DELETE", &uri, json!({"username": "adson"})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_without_username_is_a_bad_request() {
        let t = TestApp::new("photos-delete-anon").await;
        let couple_id = couple(&t).await;
        upload(&t, couple_id, "adson", "praia").await;
        let photo_id = wall(&t, couple_id, "adson").await[0]["id"].as_i64().unwrap();

        let req = Request::builder()
            .method("DELETE")
            .uri(format!("/api/photos/{}", photo_id))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, _) = t.send(req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn listing_without_username_still_works() {
        let t = TestApp::new("photos-anon-list").await;
        let couple_id = couple(&t).await;
        upload(&t, couple_id, "isabella", "flores").await;

        let (status, body) = t.get(&format!("/api/photos/{}", couple_id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["user_has_liked"], false);
    }
}
