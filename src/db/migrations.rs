use rusqlite::Connection;

const MIGRATION_001: &str = include_str!("../../migrations/001_initial.sql");

struct Migration {
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    name: "001_initial",
    sql: MIGRATION_001,
}];

/// Run all pending migrations, tracked in a `_migrations` table.
pub fn run(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    for migration in MIGRATIONS {
        let already_applied: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM _migrations WHERE name = ?1",
            [migration.name],
            |row| row.get(0),
        )?;

        if already_applied {
            log::debug!("Migration '{}' already applied, skipping", migration.name);
            continue;
        }

        log::info!("Applying migration '{}'", migration.name);
        conn.execute_batch(migration.sql)?;
        conn.execute("INSERT INTO _migrations (name) VALUES (?1)", [migration.name])?;
    }

    Ok(())
}
