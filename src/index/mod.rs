//! IndexEntry and the Index Store (spec §3.1, §3.2, §4.4, §6.4): a
//! single-table SQLite database describing every regular file and directory
//! in a tree, used as both the on-disk format and the transport artifact
//! between the remote agent and the local engine.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};

pub const INDEX_DB_FILENAME: &str = "indexing_files.db";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS files (
    path     TEXT NOT NULL,
    rel      TEXT NOT NULL,
    size     INTEGER NOT NULL,
    mod_time INTEGER NOT NULL,
    hash     TEXT NOT NULL,
    is_dir   INTEGER NOT NULL,
    checked  INTEGER NOT NULL DEFAULT 0
)";

/// A single filesystem object within a tree rooted at some `root` (spec
/// §3.1). `rel` is the join key between a local and a remote view of the
/// same logical tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub path: PathBuf,
    pub rel: String,
    pub size: i64,
    pub mod_time: i64,
    pub hash: String,
    pub is_dir: bool,
    pub checked: bool,
}

/// A thin wrapper around the SQLite DB file (spec §4.4). Legacy indices
/// (produced by an agent older than the `checked` column) fall back to an
/// in-memory set for `checked` state, detected via `PRAGMA table_info`.
pub struct IndexStore {
    conn: Connection,
    checked_fallback: Option<Mutex<HashSet<String>>>,
}

impl IndexStore {
    /// Creates a fresh, empty index database at `path`, overwriting any
    /// existing file. Used by the indexing agent at the start of a run.
    pub fn create(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path).map_err(|source| Error::PerFileIo {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path).map_err(|source| Error::IndexSchema {
            path: path.to_path_buf(),
            source,
        })?;
        conn.execute_batch(SCHEMA)
            .map_err(|source| Error::IndexSchema {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            conn,
            checked_fallback: None,
        })
    }

    /// Opens an existing index database. `read_write` controls whether the
    /// `checked` column may be mutated (only push-force does this).
    pub fn open(path: &Path, read_write: bool) -> Result<Self> {
        let flags = if read_write {
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
        } else {
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
        };
        let conn =
            Connection::open_with_flags(path, flags).map_err(|source| Error::IndexSchema {
                path: path.to_path_buf(),
                source,
            })?;

        let has_checked = Self::table_has_checked_column(&conn).map_err(|source| {
            Error::IndexSchema {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let checked_fallback = if has_checked {
            None
        } else {
            Some(Mutex::new(HashSet::new()))
        };

        Ok(Self {
            conn,
            checked_fallback,
        })
    }

    fn table_has_checked_column(conn: &Connection) -> rusqlite::Result<bool> {
        let mut stmt = conn.prepare("PRAGMA table_info(files)")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            if name == "checked" {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn insert(&self, entry: &IndexEntry) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO files (path, rel, size, mod_time, hash, is_dir, checked)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.path.to_string_lossy(),
                    entry.rel,
                    entry.size,
                    entry.mod_time,
                    entry.hash,
                    entry.is_dir as i64,
                    entry.checked as i64,
                ],
            )
            .map_err(|source| Error::IndexSchema {
                path: PathBuf::new(),
                source,
            })?;
        Ok(())
    }

    fn select_columns(&self) -> &'static str {
        if self.checked_fallback.is_some() {
            "path, rel, size, mod_time, hash, is_dir"
        } else {
            "path, rel, size, mod_time, hash, is_dir, checked"
        }
    }

    fn row_to_entry(&self, row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexEntry> {
        let path_str: String = row.get(0)?;
        let rel: String = row.get(1)?;
        let is_dir_int: i64 = row.get(5)?;
        let checked = if let Some(fallback) = &self.checked_fallback {
            fallback.lock().contains(&rel)
        } else {
            let checked_int: i64 = row.get(6)?;
            checked_int != 0
        };
        Ok(IndexEntry {
            path: PathBuf::from(path_str),
            rel,
            size: row.get(2)?,
            mod_time: row.get(3)?,
            hash: row.get(4)?,
            is_dir: is_dir_int != 0,
            checked,
        })
    }

    /// All entries, sorted by `rel` ascending (spec §4.5.7: deterministic
    /// iteration for any side-effecting pass).
    pub fn all_entries(&self) -> Result<Vec<IndexEntry>> {
        let sql = format!(
            "SELECT {} FROM files ORDER BY rel ASC",
            self.select_columns()
        );
        let mut stmt = self.conn.prepare(&sql).map_err(|source| Error::IndexSchema {
            path: PathBuf::new(),
            source,
        })?;
        let rows = stmt
            .query_map([], |row| self.row_to_entry(row))
            .map_err(|source| Error::IndexSchema {
                path: PathBuf::new(),
                source,
            })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|source| Error::IndexSchema {
                path: PathBuf::new(),
                source,
            })?);
        }
        Ok(out)
    }

    pub fn get_by_rel(&self, rel: &str) -> Result<Option<IndexEntry>> {
        let sql = format!("SELECT {} FROM files WHERE rel = ?1", self.select_columns());
        self.conn
            .query_row(&sql, params![rel], |row| self.row_to_entry(row))
            .optional()
            .map_err(|source| Error::IndexSchema {
                path: PathBuf::new(),
                source,
            })
    }

    /// Marks `rel` as checked (spec §4.5.3 step 4). Falls back to an
    /// in-memory set on legacy indices lacking the `checked` column.
    pub fn set_checked(&self, rel: &str) -> Result<()> {
        if let Some(fallback) = &self.checked_fallback {
            fallback.lock().insert(rel.to_string());
            return Ok(());
        }
        self.conn
            .execute(
                "UPDATE files SET checked = 1 WHERE rel = ?1",
                params![rel],
            )
            .map_err(|source| Error::IndexSchema {
                path: PathBuf::new(),
                source,
            })?;
        Ok(())
    }

    pub fn is_checked(&self, rel: &str) -> Result<bool> {
        if let Some(fallback) = &self.checked_fallback {
            return Ok(fallback.lock().contains(rel));
        }
        Ok(self
            .get_by_rel(rel)?
            .map(|e| e.checked)
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(rel: &str, hash: &str) -> IndexEntry {
        IndexEntry {
            path: PathBuf::from(format!("/root/{rel}")),
            rel: rel.to_string(),
            size: 4,
            mod_time: 0,
            hash: hash.to_string(),
            is_dir: false,
            checked: false,
        }
    }

    #[test]
    fn insert_and_lookup_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INDEX_DB_FILENAME);
        let store = IndexStore::create(&path).unwrap();
        store.insert(&sample("a.txt", "deadbeefcafef00d")).unwrap();
        let entry = store.get_by_rel("a.txt").unwrap().unwrap();
        assert_eq!(entry.hash, "deadbeefcafef00d");
        assert!(!entry.checked);
    }

    #[test]
    fn entries_are_sorted_by_rel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INDEX_DB_FILENAME);
        let store = IndexStore::create(&path).unwrap();
        store.insert(&sample("b.txt", "00")).unwrap();
        store.insert(&sample("a.txt", "00")).unwrap();
        let rels: Vec<_> = store.all_entries().unwrap().into_iter().map(|e| e.rel).collect();
        assert_eq!(rels, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn set_checked_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INDEX_DB_FILENAME);
        {
            let store = IndexStore::create(&path).unwrap();
            store.insert(&sample("a.txt", "00")).unwrap();
        }
        let store = IndexStore::open(&path, true).unwrap();
        store.set_checked("a.txt").unwrap();
        assert!(store.is_checked("a.txt").unwrap());
    }

    #[test]
    fn legacy_index_without_checked_column_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INDEX_DB_FILENAME);
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE files (path TEXT, rel TEXT, size INTEGER, mod_time INTEGER, hash TEXT, is_dir INTEGER)",
            )
            .unwrap();
            conn.execute(
                "INSERT INTO files (path, rel, size, mod_time, hash, is_dir) VALUES ('/r/a', 'a', 1, 0, 'aa', 0)",
                [],
            )
            .unwrap();
        }
        let store = IndexStore::open(&path, true).unwrap();
        assert!(!store.is_checked("a").unwrap());
        store.set_checked("a").unwrap();
        assert!(store.is_checked("a").unwrap());
    }
}
