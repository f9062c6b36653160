use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

/// Forward-only schema migrations keyed by `schema_version`.
pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (couples, users, messages)");
        conn.execute_batch(
            "
            CREATE TABLE couples (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                invite_code  TEXT NOT NULL UNIQUE,
                created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE users (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                couple_id    INTEGER NOT NULL REFERENCES couples(id),
                username     TEXT NOT NULL UNIQUE COLLATE NOCASE,
                password     TEXT NOT NULL,
                profile_pic  TEXT,
                created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE messages (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                couple_id       INTEGER NOT NULL REFERENCES couples(id),
                sender_user_id  INTEGER NOT NULL REFERENCES users(id),
                message_text    TEXT NOT NULL,
                created_at      TEXT NOT NULL
            );

            CREATE INDEX idx_messages_couple ON messages(couple_id, id);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (photo wall)");
        conn.execute_batch(
            "
            CREATE TABLE photos (
                id                   INTEGER PRIMARY KEY AUTOINCREMENT,
                couple_id            INTEGER NOT NULL REFERENCES couples(id),
                image_path           TEXT NOT NULL,
                caption              TEXT NOT NULL DEFAULT '',
                uploaded_by_user_id  INTEGER NOT NULL REFERENCES users(id),
                created_at           TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE INDEX idx_photos_couple ON photos(couple_id, created_at);

            CREATE TABLE photo_likes (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id   INTEGER NOT NULL REFERENCES users(id),
                photo_id  INTEGER NOT NULL REFERENCES photos(id) ON DELETE CASCADE,
                UNIQUE(user_id, photo_id)
            );

            CREATE INDEX idx_photo_likes_photo ON photo_likes(photo_id);

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
