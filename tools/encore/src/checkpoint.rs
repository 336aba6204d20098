//! Replay progress persistence. A checkpoint row is appended after every
//! successfully completed step; `load` returns the newest row for a run,
//! which is all a resume needs. History stays queryable so an external
//! monitor can watch progress without contending with the writer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tokio::sync::{mpsc, oneshot};

use crate::errors::EncoreError;

const READ_POOL_SIZE: usize = 2;

type StoreResult<T> = Result<T, EncoreError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub run_id: String,
    pub workflow_name: String,
    pub version: String,
    pub last_completed_index: u32,
    pub artifacts: Vec<PathBuf>,
    pub updated_at: i64,
}

pub trait CheckpointStore: Send + Sync {
    fn save(&self, checkpoint: &Checkpoint) -> StoreResult<()>;
    fn load(&self, run_id: &str) -> StoreResult<Option<Checkpoint>>;
}

#[derive(Debug)]
enum WriteCmd {
    Save {
        checkpoint: Checkpoint,
        reply: oneshot::Sender<StoreResult<()>>,
    },
}

struct ReadPool {
    conns: Arc<Vec<Mutex<Connection>>>,
    next: Arc<AtomicUsize>,
}

impl ReadPool {
    fn open(path: &Path, size: usize) -> StoreResult<Self> {
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .map_err(db_err)?;
            conn.busy_timeout(std::time::Duration::from_secs(3))
                .map_err(db_err)?;
            conns.push(Mutex::new(conn));
        }
        Ok(Self {
            conns: Arc::new(conns),
            next: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        let guard = self.conns[idx]
            .lock()
            .map_err(|_| EncoreError::Database("read connection lock poisoned".to_string()))?;
        f(&guard)
    }
}

pub struct SqliteCheckpointStore {
    write_tx: Option<mpsc::Sender<WriteCmd>>,
    read_pool: ReadPool,
    writer_join: Option<thread::JoinHandle<()>>,
}

impl Drop for SqliteCheckpointStore {
    fn drop(&mut self) {
        // Close the sender first so the writer loop exits.
        drop(self.write_tx.take());
        // Then join the writer thread to flush any in-flight writes.
        if let Some(handle) = self.writer_join.take() {
            let _ = handle.join();
        }
    }
}

impl SqliteCheckpointStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EncoreError::Database(e.to_string()))?;
        }

        let mut write_conn = Connection::open(&path).map_err(db_err)?;
        configure_write_connection(&write_conn)?;
        run_migrations(&mut write_conn)?;

        let (write_tx, mut write_rx) = mpsc::channel(128);
        let writer_join = thread::spawn(move || {
            while let Some(cmd) = write_rx.blocking_recv() {
                match cmd {
                    WriteCmd::Save { checkpoint, reply } => {
                        let result = insert_checkpoint(&write_conn, &checkpoint);
                        let _ = reply.send(result);
                    }
                }
            }
        });

        let read_pool = ReadPool::open(&path, READ_POOL_SIZE)?;
        Ok(Self {
            write_tx: Some(write_tx),
            read_pool,
            writer_join: Some(writer_join),
        })
    }

    fn sender(&self) -> StoreResult<&mpsc::Sender<WriteCmd>> {
        self.write_tx
            .as_ref()
            .ok_or_else(|| EncoreError::Database("store is closed".to_string()))
    }

    /// Every checkpoint row for a run, oldest first.
    pub fn history(&self, run_id: &str) -> StoreResult<Vec<Checkpoint>> {
        self.read_pool.with_conn(|conn| {
            let mut statement = conn
                .prepare(
                    "SELECT run_id, workflow_name, version, last_completed_index, artifacts, updated_at \
                     FROM checkpoints WHERE run_id = ?1 ORDER BY seq ASC",
                )
                .map_err(db_err)?;
            let rows = statement
                .query_map([run_id], row_to_checkpoint)
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender()?
            .blocking_send(WriteCmd::Save {
                checkpoint: checkpoint.clone(),
                reply: reply_tx,
            })
            .map_err(|e| EncoreError::Database(e.to_string()))?;
        reply_rx
            .blocking_recv()
            .map_err(|e| EncoreError::Database(e.to_string()))?
    }

    fn load(&self, run_id: &str) -> StoreResult<Option<Checkpoint>> {
        self.read_pool.with_conn(|conn| {
            conn.query_row(
                "SELECT run_id, workflow_name, version, last_completed_index, artifacts, updated_at \
                 FROM checkpoints WHERE run_id = ?1 ORDER BY seq DESC LIMIT 1",
                [run_id],
                row_to_checkpoint,
            )
            .optional()
            .map_err(db_err)
        })
    }
}

fn configure_write_connection(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(db_err)?;
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(db_err)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(db_err)?;
    Ok(())
}

fn run_migrations(conn: &mut Connection) -> StoreResult<()> {
    let migrations = [(1_i64, include_str!("../migrations/0001_checkpoints.sql"))];

    conn.execute_batch(
        "BEGIN IMMEDIATE; CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL); COMMIT;",
    )
    .map_err(db_err)?;

    for (version, sql) in migrations {
        let exists = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?
            .is_some();
        if exists {
            continue;
        }

        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(sql).map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, unix_millis()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
    }

    Ok(())
}

fn insert_checkpoint(conn: &Connection, checkpoint: &Checkpoint) -> StoreResult<()> {
    let artifacts = serde_json::to_string(
        &checkpoint
            .artifacts
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>(),
    )
    .map_err(|e| EncoreError::Database(e.to_string()))?;

    conn.execute(
        "INSERT INTO checkpoints (run_id, workflow_name, version, last_completed_index, artifacts, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            checkpoint.run_id,
            checkpoint.workflow_name,
            checkpoint.version,
            checkpoint.last_completed_index,
            artifacts,
            checkpoint.updated_at,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<Checkpoint> {
    let artifacts_json: String = row.get(4)?;
    let artifacts: Vec<String> = serde_json::from_str(&artifacts_json).unwrap_or_default();
    Ok(Checkpoint {
        run_id: row.get(0)?,
        workflow_name: row.get(1)?,
        version: row.get(2)?,
        last_completed_index: row.get(3)?,
        artifacts: artifacts.into_iter().map(PathBuf::from).collect(),
        updated_at: row.get(5)?,
    })
}

fn db_err(error: rusqlite::Error) -> EncoreError {
    EncoreError::Database(error.to_string())
}

fn unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// In-memory store for tests; keeps the full append-only history.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    rows: Mutex<HashMap<String, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn history(&self, run_id: &str) -> Vec<Checkpoint> {
        self.rows
            .lock()
            .expect("rows lock")
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn seed(&self, checkpoint: Checkpoint) {
        self.rows
            .lock()
            .expect("rows lock")
            .entry(checkpoint.run_id.clone())
            .or_default()
            .push(checkpoint);
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        self.rows
            .lock()
            .expect("rows lock")
            .entry(checkpoint.run_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    fn load(&self, run_id: &str) -> StoreResult<Option<Checkpoint>> {
        Ok(self
            .rows
            .lock()
            .expect("rows lock")
            .get(run_id)
            .and_then(|rows| rows.last().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store() -> (SqliteCheckpointStore, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let db = dir.path().join("checkpoints.sqlite");
        (SqliteCheckpointStore::open(&db).expect("open store"), dir)
    }

    fn checkpoint(run_id: &str, index: u32) -> Checkpoint {
        Checkpoint {
            run_id: run_id.to_string(),
            workflow_name: "generate_screenshots".to_string(),
            version: "1.0.0".to_string(),
            last_completed_index: index,
            artifacts: vec![PathBuf::from("/tmp/out/desktop_overview.png")],
            updated_at: 1_700_000_000_000 + i64::from(index),
        }
    }

    #[test]
    fn save_then_load_round_trips_every_field() {
        let (store, _dir) = temp_store();
        let saved = checkpoint("run-a", 0);
        store.save(&saved).expect("save");
        let loaded = store.load("run-a").expect("load").expect("present");
        assert_eq!(loaded, saved);
    }

    #[test]
    fn load_returns_newest_row_and_history_keeps_all() {
        let (store, _dir) = temp_store();
        for index in 0..3 {
            store.save(&checkpoint("run-a", index)).expect("save");
        }
        let loaded = store.load("run-a").expect("load").expect("present");
        assert_eq!(loaded.last_completed_index, 2);

        let history = store.history("run-a").expect("history");
        assert_eq!(history.len(), 3);
        assert_eq!(
            history
                .iter()
                .map(|c| c.last_completed_index)
                .collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn runs_do_not_share_checkpoint_keys() {
        let (store, _dir) = temp_store();
        store.save(&checkpoint("run-a", 4)).expect("save");
        assert!(store.load("run-b").expect("load").is_none());
    }

    #[test]
    fn store_reopens_with_existing_rows() {
        let dir = TempDir::new().expect("tempdir");
        let db = dir.path().join("checkpoints.sqlite");
        {
            let store = SqliteCheckpointStore::open(&db).expect("open");
            store.save(&checkpoint("run-a", 1)).expect("save");
        }
        let store = SqliteCheckpointStore::open(&db).expect("reopen");
        let loaded = store.load("run-a").expect("load").expect("present");
        assert_eq!(loaded.last_completed_index, 1);
    }

    #[test]
    fn in_memory_store_mirrors_the_contract() {
        let store = InMemoryCheckpointStore::default();
        store.save(&checkpoint("run-a", 0)).expect("save");
        store.save(&checkpoint("run-a", 1)).expect("save");
        assert_eq!(
            store
                .load("run-a")
                .expect("load")
                .expect("present")
                .last_completed_index,
            1
        );
        assert_eq!(store.history("run-a").len(), 2);
    }
}
