pub mod migrations;
pub mod queries;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use r2d2::Pool;
use r2d2_sqlite::rusqlite::OpenFlags;
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::Result;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = r2d2::PooledConnection<SqliteConnectionManager>;

/// Initialize the SQLite database with connection pooling and WAL mode.
pub fn init_db(data_dir: &Path) -> Result<DbPool> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("squirrelops.db");
    log::info!("Database path: {}", db_path.display());

    let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )?;
        Ok(())
    });

    let pool = Pool::builder().max_size(4).build(manager)?;

    let conn = pool.get()?;
    migrations::run(&conn)?;

    log::info!("Database initialized");
    Ok(pool)
}

/// In-memory database for tests, schema applied.
///
/// Uses a uniquely-named shared-cache in-memory database so the pool can
/// hand out more than one connection at a time (plain `:memory:` gives
/// each connection its own private, unshared database, which deadlocks
/// any test that holds a connection while other code also needs one).
pub fn init_test_db() -> DbPool {
    static NEXT_TEST_DB_ID: AtomicU64 = AtomicU64::new(0);
    let id = NEXT_TEST_DB_ID.fetch_add(1, Ordering::Relaxed);
    let uri = format!("file:test_db_{id}?mode=memory&cache=shared");

    let manager = SqliteConnectionManager::file(&uri)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )
        .with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys=ON;")?;
            Ok(())
        });
    let pool = Pool::builder().max_size(4).build(manager).unwrap();
    let conn = pool.get().unwrap();
    migrations::run(&conn).unwrap();
    pool
}
