use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRow {
    pub key: String,
    pub value: String,
    pub expires_at: u64,
}

#[derive(Debug)]
pub struct SnapshotStore {
    conn: Mutex<Connection>,
}

impl SnapshotStore {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
CREATE TABLE IF NOT EXISTS cache_entries (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  expires_at INTEGER NOT NULL
);
",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn load_live(&self, now_millis: u64) -> Result<Vec<SnapshotRow>, rusqlite::Error> {
        let conn = self.conn.lock().expect("snapshot mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT key, value, expires_at FROM cache_entries WHERE expires_at = 0 OR expires_at > ?1",
        )?;
        let rows = stmt.query_map(params![now_millis as i64], |row| {
            Ok(SnapshotRow {
                key: row.get(0)?,
                value: row.get(1)?,
                expires_at: row.get::<_, i64>(2)?.max(0) as u64,
            })
        })?;
        rows.collect()
    }

    pub fn replace_all(&self, rows: &[SnapshotRow]) -> Result<(), rusqlite::Error> {
        let mut conn = self.conn.lock().expect("snapshot mutex poisoned");
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM cache_entries", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO cache_entries(key, value, expires_at) VALUES (?1, ?2, ?3)",
            )?;
            for row in rows {
                insert.execute(params![row.key, row.value, row.expires_at as i64])?;
            }
        }
        tx.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &str, expires_at: u64) -> SnapshotRow {
        SnapshotRow {
            key: key.to_string(),
            value: format!("\"{key}\""),
            expires_at,
        }
    }

    #[test]
    fn replaces_and_loads_live_rows() {
        let db = SnapshotStore::open(Path::new(":memory:")).expect("db open");
        db.replace_all(&[row("stale", 10), row("live", 5_000), row("forever", 0)])
            .expect("write");

        let mut keys: Vec<_> = db
            .load_live(1_000)
            .expect("read")
            .into_iter()
            .map(|r| r.key)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["forever", "live"]);

        db.replace_all(&[row("only", 0)]).expect("rewrite");
        assert_eq!(db.load_live(1_000).expect("read"), vec![row("only", 0)]);
    }
}
