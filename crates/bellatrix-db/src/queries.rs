use crate::Database;
use crate::models::{MessageRow, PhotoListRow, PhotoRow, Registration, UserRow, format_timestamp};
use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;

/// How many fresh invite codes to try before giving up on a registration.
const INVITE_CODE_ATTEMPTS: usize = 8;

/// Registration failures the API maps to client errors. Returned wrapped in
/// `anyhow::Error`; callers downcast.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("invite code not found")]
    InviteNotFound,
    #[error("username already taken")]
    UsernameTaken,
}

impl Database {
    // -- Couples & users --

    /// Create a user, either inside the couple owning `invite_code` or inside
    /// a brand new couple whose code is drawn from `new_invite_code`.
    ///
    /// Couple and user rows are written in one transaction.
    pub fn register_user(
        &self,
        username: &str,
        password_hash: &str,
        profile_pic: Option<&str>,
        invite_code: Option<&str>,
        mut new_invite_code: impl FnMut() -> String,
    ) -> Result<Registration> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let taken = tx
                .query_row("SELECT 1 FROM users WHERE username = ?1", [username], |_| Ok(()))
                .optional()?
                .is_some();
            if taken {
                return Err(RegisterError::UsernameTaken.into());
            }

            let (couple_id, created_code) = match invite_code {
                Some(code) => {
                    let couple_id: i64 = tx
                        .query_row(
                            "SELECT id FROM couples WHERE invite_code = ?1",
                            [code.trim().to_uppercase()],
                            |row| row.get(0),
                        )
                        .optional()?
                        .ok_or(RegisterError::InviteNotFound)?;
                    (couple_id, None)
                }
                None => {
                    let code = unused_invite_code(&tx, &mut new_invite_code)?;
                    tx.execute("INSERT INTO couples (invite_code) VALUES (?1)", [&code])?;
                    (tx.last_insert_rowid(), Some(code))
                }
            };

            tx.execute(
                "INSERT INTO users (couple_id, username, password, profile_pic) VALUES (?1, ?2, ?3, ?4)",
                params![couple_id, username, password_hash, profile_pic],
            )?;
            let user_id = tx.last_insert_rowid();

            tx.commit()?;

            Ok(Registration {
                user_id,
                couple_id,
                invite_code: created_code,
            })
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, couple_id, username, password, profile_pic FROM users WHERE username = ?1",
                [username],
                user_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, couple_id, username, password, profile_pic FROM users WHERE id = ?1",
                [id],
                user_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn get_invite_code(&self, couple_id: i64) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT invite_code FROM couples WHERE id = ?1",
                [couple_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
        })
    }

    // -- Messages --

    /// Persist a message and return its id. Ids are the total order of a
    /// couple's conversation.
    pub fn insert_message(
        &self,
        couple_id: i64,
        sender_user_id: i64,
        text: &str,
        created_at: &DateTime<Utc>,
    ) -> Result<i64> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO messages (couple_id, sender_user_id, message_text, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![couple_id, sender_user_id, text, format_timestamp(created_at)],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// The newest `limit` messages of a couple, returned oldest first.
    pub fn recent_messages(&self, couple_id: i64, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_messages(conn, couple_id, i64::MAX, limit))
    }

    /// Up to `limit` messages strictly older than `before_id`, returned
    /// oldest first.
    pub fn messages_before(&self, couple_id: i64, before_id: i64, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_messages(conn, couple_id, before_id, limit))
    }

    // -- Photos --

    pub fn insert_photo(
        &self,
        couple_id: i64,
        image_path: &str,
        caption: &str,
        uploaded_by_user_id: i64,
    ) -> Result<i64> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO photos (couple_id, image_path, caption, uploaded_by_user_id) VALUES (?1, ?2, ?3, ?4)",
                params![couple_id, image_path, caption, uploaded_by_user_id],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_photo(&self, id: i64) -> Result<Option<PhotoRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, couple_id, image_path, caption, uploaded_by_user_id FROM photos WHERE id = ?1",
                [id],
                |row| {
                    Ok(PhotoRow {
                        id: row.get(0)?,
                        couple_id: row.get(1)?,
                        image_path: row.get(2)?,
                        caption: row.get(3)?,
                        uploaded_by_user_id: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// All photos of a couple, newest first. `viewer_id` drives the
    /// per-photo "liked by me" flag; `None` means nobody.
    pub fn list_photos(&self, couple_id: i64, viewer_id: Option<i64>) -> Result<Vec<PhotoListRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT p.id, p.image_path, p.caption, COALESCE(u.username, ''),
                        (SELECT COUNT(*) FROM photo_likes pl WHERE pl.photo_id = p.id),
                        EXISTS (SELECT 1 FROM photo_likes pl WHERE pl.photo_id = p.id AND pl.user_id = ?2)
                 FROM photos p
                 LEFT JOIN users u ON p.uploaded_by_user_id = u.id
                 WHERE p.couple_id = ?1
                 ORDER BY p.created_at DESC, p.id DESC",
            )?;

            let rows = stmt
                .query_map(params![couple_id, viewer_id], |row| {
                    Ok(PhotoListRow {
                        id: row.get(0)?,
                        image_path: row.get(1)?,
                        caption: row.get(2)?,
                        uploaded_by: row.get(3)?,
                        like_count: row.get(4)?,
                        viewer_liked: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Toggle a like: removes it if present, inserts it if not.
    /// Returns (liked, like_count) as seen right after the toggle.
    pub fn toggle_like(&self, photo_id: i64, user_id: i64) -> Result<(bool, i64)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM photo_likes WHERE user_id = ?1 AND photo_id = ?2",
                    params![user_id, photo_id],
                    |row| row.get(0),
                )
                .optional()?;

            let liked = match existing {
                Some(like_id) => {
                    tx.execute("DELETE FROM photo_likes WHERE id = ?1", [like_id])?;
                    false
                }
                None => {
                    tx.execute(
                        "INSERT INTO photo_likes (user_id, photo_id) VALUES (?1, ?2)",
                        params![user_id, photo_id],
                    )?;
                    true
                }
            };

            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM photo_likes WHERE photo_id = ?1",
                [photo_id],
                |row| row.get(0),
            )?;

            tx.commit()?;
            Ok((liked, count))
        })
    }

    /// Delete a photo row; its likes cascade. Returns false if it was
    /// already gone.
    pub fn delete_photo(&self, id: i64) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let deleted = conn.execute("DELETE FROM photos WHERE id = ?1", [id])?;
            Ok(deleted > 0)
        })
    }
}

fn unused_invite_code(conn: &Connection, generate: &mut impl FnMut() -> String) -> Result<String> {
    for _ in 0..INVITE_CODE_ATTEMPTS {
        let code = generate();
        let exists = conn
            .query_row("SELECT 1 FROM couples WHERE invite_code = ?1", [&code], |_| Ok(()))
            .optional()?
            .is_some();
        if !exists {
            return Ok(code);
        }
    }
    bail!("no unused invite code after {} attempts", INVITE_CODE_ATTEMPTS)
}

fn query_messages(conn: &Connection, couple_id: i64, before_id: i64, limit: u32) -> Result<Vec<MessageRow>> {
    // Newest first so LIMIT keeps the most recent page, then flipped below
    let mut stmt = conn.prepare(
        "SELECT m.id, m.couple_id, m.sender_user_id, u.username, u.profile_pic, m.message_text, m.created_at
         FROM messages m
         JOIN users u ON m.sender_user_id = u.id
         WHERE m.couple_id = ?1 AND m.id < ?2
         ORDER BY m.id DESC
         LIMIT ?3",
    )?;

    let mut rows = stmt
        .query_map(params![couple_id, before_id, limit], message_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.reverse();
    Ok(rows)
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        couple_id: row.get(1)?,
        username: row.get(2)?,
        password: row.get(3)?,
        profile_pic: row.get(4)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        couple_id: row.get(1)?,
        sender_user_id: row.get(2)?,
        username: row.get(3)?,
        profile_pic: row.get(4)?,
        message_text: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TempDatabase;

    fn codes(list: &[&str]) -> impl FnMut() -> String {
        let mut list: Vec<String> = list.iter().map(|s| s.to_string()).collect();
        list.reverse();
        move || list.pop().expect("ran out of invite codes")
    }

    fn couple_count(db: &Database) -> i64 {
        db.with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM couples", [], |r| r.get(0))?))
            .unwrap()
    }

    /// Registers adson (new couple, code ABC234) and isabella (joins it).
    fn seed_couple(db: &Database) -> (Registration, Registration) {
        let adson = db
            .register_user("adson", "hash", None, None, codes(&["ABC234"]))
            .unwrap();
        let isabella = db
            .register_user("isabella", "hash", Some("/uploads/bella.png"), Some("ABC234"), codes(&[]))
            .unwrap();
        (adson, isabella)
    }

    #[test]
    fn registration_without_code_creates_one_couple() {
        let db = TempDatabase::new("reg-new");

        let reg = db
            .register_user("adson", "hash", None, None, codes(&["ABC234"]))
            .unwrap();

        assert_eq!(reg.invite_code.as_deref(), Some("ABC234"));
        assert_eq!(couple_count(&db), 1);
        assert_eq!(db.get_invite_code(reg.couple_id).unwrap().as_deref(), Some("ABC234"));
    }

    #[test]
    fn registration_with_code_joins_existing_couple() {
        let db = TempDatabase::new("reg-join");
        let (adson, isabella) = seed_couple(&db);

        assert_eq!(isabella.couple_id, adson.couple_id);
        assert!(isabella.invite_code.is_none());
        assert_eq!(couple_count(&db), 1);
    }

    #[test]
    fn invite_code_lookup_ignores_case_and_whitespace() {
        let db = TempDatabase::new("reg-case");
        let adson = db
            .register_user("adson", "hash", None, None, codes(&["ABC234"]))
            .unwrap();

        let joined = db
            .register_user("isabella", "hash", None, Some(" abc234 "), codes(&[]))
            .unwrap();
        assert_eq!(joined.couple_id, adson.couple_id);
    }

    #[test]
    fn unknown_invite_code_is_rejected_without_side_effects() {
        let db = TempDatabase::new("reg-bad-code");

        let err = db
            .register_user("isabella", "hash", None, Some("NOPE99"), codes(&[]))
            .unwrap_err();

        assert_eq!(err.downcast_ref::<RegisterError>(), Some(&RegisterError::InviteNotFound));
        assert!(db.get_user_by_username("isabella").unwrap().is_none());
        assert_eq!(couple_count(&db), 0);
    }

    #[test]
    fn duplicate_username_is_rejected_case_insensitively() {
        let db = TempDatabase::new("reg-dup");
        seed_couple(&db);

        let err = db
            .register_user("Adson", "hash", None, None, codes(&["XYZ789"]))
            .unwrap_err();

        assert_eq!(err.downcast_ref::<RegisterError>(), Some(&RegisterError::UsernameTaken));
        assert_eq!(couple_count(&db), 1);
    }

    #[test]
    fn colliding_invite_codes_are_regenerated() {
        let db = TempDatabase::new("reg-collide");
        db.register_user("adson", "hash", None, None, codes(&["ABC234"]))
            .unwrap();

        let reg = db
            .register_user("bruno", "hash", None, None, codes(&["ABC234", "ABC234", "QRS567"]))
            .unwrap();

        assert_eq!(reg.invite_code.as_deref(), Some("QRS567"));
        assert_eq!(couple_count(&db), 2);
    }

    #[test]
    fn recent_messages_are_the_latest_window_in_order() {
        let db = TempDatabase::new("msg-recent");
        let (adson, isabella) = seed_couple(&db);
        let now = Utc::now();

        for i in 0..45 {
            let sender = if i % 2 == 0 { adson.user_id } else { isabella.user_id };
            db.insert_message(adson.couple_id, sender, &format!("msg {}", i), &now)
                .unwrap();
        }

        let window = db.recent_messages(adson.couple_id, 30).unwrap();
        let texts: Vec<String> = window.iter().map(|m| m.message_text.clone()).collect();
        let expected: Vec<String> = (15..45).map(|i| format!("msg {}", i)).collect();
        assert_eq!(texts, expected);
        assert_eq!(window[0].profile_pic.as_deref(), Some("/uploads/bella.png"));
        assert!(window[1].profile_pic.is_none());
    }

    #[test]
    fn messages_before_pages_backwards_without_gaps() {
        let db = TempDatabase::new("msg-page");
        let (adson, _) = seed_couple(&db);
        let now = Utc::now();

        let ids: Vec<i64> = (0..50)
            .map(|i| {
                db.insert_message(adson.couple_id, adson.user_id, &format!("m{}", i), &now)
                    .unwrap()
            })
            .collect();

        let mut seen: Vec<i64> = db
            .recent_messages(adson.couple_id, 30)
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();

        loop {
            let cursor = seen[0];
            let page = db.messages_before(adson.couple_id, cursor, 20).unwrap();
            if page.is_empty() {
                break;
            }
            let mut page_ids: Vec<i64> = page.iter().map(|m| m.id).collect();
            assert!(page_ids.iter().all(|id| *id < cursor));
            page_ids.extend(seen);
            seen = page_ids;
        }

        assert_eq!(seen, ids);
    }

    #[test]
    fn repeated_backfill_returns_the_same_page() {
        let db = TempDatabase::new("msg-idem");
        let (adson, _) = seed_couple(&db);
        let now = Utc::now();
        let mut last = 0;
        for i in 0..25 {
            last = db
                .insert_message(adson.couple_id, adson.user_id, &format!("m{}", i), &now)
                .unwrap();
        }

        let first: Vec<i64> = db
            .messages_before(adson.couple_id, last, 20)
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        let second: Vec<i64> = db
            .messages_before(adson.couple_id, last, 20)
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();

        assert_eq!(first.len(), 20);
        assert_eq!(first, second);
    }

    #[test]
    fn messages_are_scoped_to_their_couple() {
        let db = TempDatabase::new("msg-scope");
        let (adson, _) = seed_couple(&db);
        let other = db
            .register_user("bruno", "hash", None, None, codes(&["QRS567"]))
            .unwrap();
        let now = Utc::now();

        db.insert_message(adson.couple_id, adson.user_id, "ours", &now).unwrap();
        db.insert_message(other.couple_id, other.user_id, "theirs", &now).unwrap();

        let ours = db.recent_messages(adson.couple_id, 30).unwrap();
        assert_eq!(ours.len(), 1);
        assert_eq!(ours[0].message_text, "ours");
    }

    #[test]
    fn like_toggle_is_an_involution() {
        let db = TempDatabase::new("like");
        let (adson, isabella) = seed_couple(&db);
        let photo = db
            .insert_photo(adson.couple_id, "/uploads/p.jpg", "praia", adson.user_id)
            .unwrap();

        assert_eq!(db.toggle_like(photo, isabella.user_id).unwrap(), (true, 1));
        assert_eq!(db.toggle_like(photo, adson.user_id).unwrap(), (true, 2));
        assert_eq!(db.toggle_like(photo, isabella.user_id).unwrap(), (false, 1));
        assert_eq!(db.toggle_like(photo, isabella.user_id).unwrap(), (true, 2));
    }

    #[test]
    fn photo_listing_reports_viewer_likes() {
        let db = TempDatabase::new("photo-list");
        let (adson, isabella) = seed_couple(&db);
        let first = db
            .insert_photo(adson.couple_id, "/uploads/a.jpg", "a", adson.user_id)
            .unwrap();
        let second = db
            .insert_photo(adson.couple_id, "/uploads/b.jpg", "b", isabella.user_id)
            .unwrap();
        db.toggle_like(first, isabella.user_id).unwrap();

        let as_isabella = db.list_photos(adson.couple_id, Some(isabella.user_id)).unwrap();
        assert_eq!(as_isabella.len(), 2);
        assert_eq!(as_isabella[0].id, second);
        assert_eq!(as_isabella[0].uploaded_by, "isabella");
        assert!(!as_isabella[0].viewer_liked);
        assert_eq!(as_isabella[1].like_count, 1);
        assert!(as_isabella[1].viewer_liked);

        let anonymous = db.list_photos(adson.couple_id, None).unwrap();
        assert!(anonymous.iter().all(|p| !p.viewer_liked));
    }

    #[test]
    fn deleting_a_photo_removes_its_likes() {
        let db = TempDatabase::new("photo-delete");
        let (adson, isabella) = seed_couple(&db);
        let photo = db
            .insert_photo(adson.couple_id, "/uploads/a.jpg", "", adson.user_id)
            .unwrap();
        db.toggle_like(photo, isabella.user_id).unwrap();

        assert!(db.delete_photo(photo).unwrap());
        assert!(!db.delete_photo(photo).unwrap());
        assert!(db.get_photo(photo).unwrap().is_none());

        let likes: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM photo_likes", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(likes, 0);
    }
}
