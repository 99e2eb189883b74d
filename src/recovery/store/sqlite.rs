//! SQLite implementation of the snapshot store.

use std::path::Path;
use std::sync::OnceLock;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use super::CheckpointStore;
use crate::errors::StageException;
use crate::errors::StageResult;
use crate::recovery::CheckpointSnapshot;
use crate::recovery::RecoveryBoundary;
use crate::recovery::StateBytes;
use crate::recovery::StepId;

// The `'static` lifetime within [`Migrations`] is saying that the
// [`str`]s composing the migrations are `'static`.
static MIGRATIONS: OnceLock<Migrations<'static>> = OnceLock::new();

fn get_migrations() -> &'static Migrations<'static> {
    MIGRATIONS.get_or_init(|| {
        Migrations::new(vec![M::up(
            "CREATE TABLE snaps ( \
             created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             step_id TEXT NOT NULL, \
             boundary INTEGER NOT NULL CHECK (boundary >= 0), \
             ser_state BLOB NOT NULL, \
             PRIMARY KEY (step_id, boundary) \
             ) STRICT",
        )])
    })
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// Stores snapshots in one SQLite DB file.
pub struct SqliteCheckpointStore {
    conn: Connection,
}

impl SqliteCheckpointStore {
    pub fn open(db_file: &Path) -> StageResult<Self> {
        tracing::info!("Opening checkpoint DB at {db_file:?}");
        let conn = Connection::open_with_flags(
            db_file,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .reraise(&format!("error opening checkpoint DB at {db_file:?}"))?;
        Self::setup(conn)
    }

    pub fn open_in_memory() -> StageResult<Self> {
        Self::setup(Connection::open_in_memory()?)
    }

    /// Setup our connection-level pragmas.
    fn setup(mut conn: Connection) -> StageResult<Self> {
        // These are recommended by Litestream.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", "5000")?;
        get_migrations()
            .to_latest(&mut conn)
            .reraise("error migrating checkpoint DB")?;
        Ok(Self { conn })
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn write(&mut self, snapshot: &CheckpointSnapshot) -> StageResult<()> {
        tracing::trace!("Writing {} of {}", snapshot.boundary, snapshot.stage);
        let txn = self.conn.transaction()?;
        txn.execute(
            "INSERT INTO snaps (step_id, boundary, ser_state) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT (step_id, boundary) DO UPDATE \
             SET ser_state = EXCLUDED.ser_state",
            (&snapshot.stage.0, snapshot.boundary.0, &snapshot.state.0),
        )?;
        txn.commit()?;
        Ok(())
    }

    fn load(
        &mut self,
        stage: &StepId,
        boundary: RecoveryBoundary,
    ) -> StageResult<Option<CheckpointSnapshot>> {
        let state = self
            .conn
            .query_row(
                "SELECT ser_state FROM snaps \
                 WHERE step_id = ?1 AND boundary = ?2",
                (&stage.0, boundary.0),
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(state.map(|state| CheckpointSnapshot {
            stage: stage.clone(),
            boundary,
            state: StateBytes(state),
        }))
    }

    fn latest(&mut self, stage: &StepId) -> StageResult<Option<CheckpointSnapshot>> {
        let row = self
            .conn
            .query_row(
                "SELECT boundary, ser_state FROM snaps \
                 WHERE step_id = ?1 \
                 ORDER BY boundary DESC LIMIT 1",
                (&stage.0,),
                |row| Ok((row.get::<_, u64>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(boundary, state)| CheckpointSnapshot {
            stage: stage.clone(),
            boundary: RecoveryBoundary(boundary),
            state: StateBytes(state),
        }))
    }

    fn gc(&mut self, stage: &StepId, before: RecoveryBoundary) -> StageResult<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM snaps WHERE step_id = ?1 AND boundary < ?2",
            (&stage.0, before.0),
        )?;
        tracing::debug!("Deleted {deleted} snapshots of {stage} before {before}");
        Ok(deleted)
    }
}

#[test]
fn upsert_load_and_gc() -> StageResult<()> {
    let stage = StepId::from("join");
    let mut store = SqliteCheckpointStore::open_in_memory()?;
    let snap = |boundary, byte| CheckpointSnapshot {
        stage: stage.clone(),
        boundary: RecoveryBoundary(boundary),
        state: StateBytes(vec![byte]),
    };

    store.write(&snap(1, 1))?;
    store.write(&snap(2, 2))?;
    store.write(&snap(2, 3))?;

    assert_eq!(store.load(&stage, RecoveryBoundary(2))?, Some(snap(2, 3)));
    assert_eq!(store.latest(&stage)?, Some(snap(2, 3)));
    assert_eq!(store.load(&stage, RecoveryBoundary(5))?, None);

    assert_eq!(store.gc(&stage, RecoveryBoundary(2))?, 1);
    assert_eq!(store.load(&stage, RecoveryBoundary(1))?, None);
    Ok(())
}
