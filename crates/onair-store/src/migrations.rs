use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Presence DB: running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE broadcasts (
                id               TEXT PRIMARY KEY,
                host_id          TEXT NOT NULL,
                host_name        TEXT NOT NULL,
                host_avatar_ref  TEXT,
                title            TEXT NOT NULL,
                room_id          TEXT NOT NULL UNIQUE,
                status           TEXT NOT NULL DEFAULT 'live'
                                 CHECK (status IN ('live', 'ended')),
                started_at       TEXT NOT NULL,
                ended_at         TEXT,
                peak_viewers     INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_broadcasts_status ON broadcasts(status);

            -- One row per present viewer. The primary key makes the viewer
            -- set a set: a user_id appears at most once per broadcast.
            CREATE TABLE broadcast_viewers (
                broadcast_id  TEXT NOT NULL REFERENCES broadcasts(id) ON DELETE CASCADE,
                user_id       TEXT NOT NULL,
                name          TEXT NOT NULL,
                avatar_ref    TEXT,
                joined_at     TEXT NOT NULL,
                PRIMARY KEY (broadcast_id, user_id)
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Presence DB migrations complete");
    Ok(())
}
