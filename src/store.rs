//! Durable peer records in SQLite.
//!
//! Columns added after the first release are listed in [`MIGRATIONS`] and
//! appended to older databases on open, so old rows read back with zero
//! values for them.

use std::{collections::HashSet, net::Ipv4Addr, path::Path, str::FromStr, sync::Arc};

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params, types::Type};
use uuid::Uuid;

use crate::wg::{Key, KeyPair};

/// (column, definition) appended by [`PeerStore::migrate`].
const MIGRATIONS: &[(&str, &str)] = &[
    ("preshared_key", "TEXT"),
    ("total_rx", "INTEGER NOT NULL DEFAULT 0"),
    ("total_tx", "INTEGER NOT NULL DEFAULT 0"),
    ("last_handshake", "INTEGER"),
    ("last_used", "INTEGER"),
    ("usage_count", "INTEGER NOT NULL DEFAULT 0"),
];

const COLUMNS: &str = "id, name, public_key, private_key, preshared_key, address, enabled, \
     created_at, total_rx, total_tx, last_handshake, last_used, usage_count";

#[derive(Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: Uuid,
    pub name: String,
    pub public_key: Key,
    pub private_key: Key,
    pub preshared_key: Option<Key>,
    pub address: Ipv4Addr,
    pub enabled: bool,
    pub created_at: i64,
    pub total_rx: u64,
    pub total_tx: u64,
    pub last_handshake: Option<i64>,
    pub last_used: Option<i64>,
    pub usage_count: u64,
}

impl Peer {
    pub fn new(
        name: impl Into<String>,
        keys: KeyPair,
        preshared_key: Option<Key>,
        address: Ipv4Addr,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            public_key: keys.public_key,
            private_key: keys.private_key,
            preshared_key,
            address,
            enabled: true,
            created_at: now_epoch_secs(),
            total_rx: 0,
            total_tx: 0,
            last_handshake: None,
            last_used: None,
            usage_count: 0,
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Peer {
            id: parse_column(row, 0)?,
            name: row.get(1)?,
            public_key: parse_column(row, 2)?,
            private_key: parse_column(row, 3)?,
            preshared_key: row
                .get::<_, Option<String>>(4)?
                .map(|s| parse_text(4, &s))
                .transpose()?,
            address: parse_column(row, 5)?,
            enabled: row.get(6)?,
            created_at: row.get(7)?,
            total_rx: row.get::<_, i64>(8)?.max(0) as u64,
            total_tx: row.get::<_, i64>(9)?.max(0) as u64,
            last_handshake: row.get(10)?,
            last_used: row.get(11)?,
            usage_count: row.get::<_, i64>(12)?.max(0) as u64,
        })
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("public_key", &self.public_key)
            .field("address", &self.address)
            .field("enabled", &self.enabled)
            .field("created_at", &self.created_at)
            .field("total_rx", &self.total_rx)
            .field("total_tx", &self.total_tx)
            .field("last_handshake", &self.last_handshake)
            .finish_non_exhaustive()
    }
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    parse_text(idx, &row.get::<_, String>(idx)?)
}

fn parse_text<T>(idx: usize, text: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    text.parse()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn to_sql_int(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Peer table. Every write is a single statement or transaction, so readers
/// never see a half written row.
#[derive(Clone)]
pub struct PeerStore {
    conn: Arc<Mutex<Connection>>,
}

impl PeerStore {
    pub fn open(path: impl AsRef<Path>) -> rusqlite::Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self::with_connection(conn)?;
        log::info!("opened peer store at {:?}", path.as_ref());
        Ok(store)
    }

    pub fn open_memory() -> rusqlite::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> rusqlite::Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> rusqlite::Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS peers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                public_key TEXT NOT NULL UNIQUE,
                private_key TEXT NOT NULL,
                address TEXT NOT NULL UNIQUE,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;

        let existing: HashSet<String> = {
            let mut stmt = tx.prepare("SELECT name FROM pragma_table_info('peers')")?;
            let names = stmt.query_map([], |row| row.get(0))?;
            names.collect::<rusqlite::Result<_>>()?
        };

        for (column, definition) in MIGRATIONS {
            if !existing.contains(*column) {
                log::info!("peer store: adding column {column}");
                tx.execute_batch(&format!("ALTER TABLE peers ADD COLUMN {column} {definition}"))?;
            }
        }

        tx.commit()
    }

    pub fn insert(&self, peer: &Peer) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO peers ({COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                peer.id.to_string(),
                peer.name,
                peer.public_key.to_string(),
                peer.private_key.to_string(),
                peer.preshared_key.map(|k| k.to_string()),
                peer.address.to_string(),
                peer.enabled,
                peer.created_at,
                to_sql_int(peer.total_rx),
                to_sql_int(peer.total_tx),
                peer.last_handshake,
                peer.last_used,
                to_sql_int(peer.usage_count),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> rusqlite::Result<Option<Peer>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM peers WHERE id = ?1"),
            params![id.to_string()],
            Peer::from_row,
        )
        .optional()
    }

    /// Newest first.
    pub fn list(&self) -> rusqlite::Result<Vec<Peer>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM peers ORDER BY created_at DESC, rowid DESC"
        ))?;

        let rows = stmt.query_map([], Peer::from_row)?;
        rows.collect()
    }

    pub fn allocated_addresses(&self) -> rusqlite::Result<HashSet<Ipv4Addr>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT address FROM peers")?;

        let rows = stmt.query_map([], |row| parse_column(row, 0))?;
        rows.collect()
    }

    /// Returns whether a row was removed.
    pub fn delete(&self, id: Uuid) -> rusqlite::Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM peers WHERE id = ?1", params![id.to_string()])?;
        Ok(n > 0)
    }

    pub fn set_enabled(&self, id: Uuid, enabled: bool) -> rusqlite::Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE peers SET enabled = ?2 WHERE id = ?1",
            params![id.to_string(), enabled],
        )?;
        Ok(n > 0)
    }

    /// Raises the cumulative counters to the given values; smaller values
    /// (daemon restarted) leave them where they are. The handshake only
    /// moves forward too.
    pub fn update_counters(
        &self,
        id: Uuid,
        rx: u64,
        tx: u64,
        last_handshake: Option<i64>,
    ) -> rusqlite::Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE peers SET
                total_rx = MAX(total_rx, ?2),
                total_tx = MAX(total_tx, ?3),
                last_handshake = CASE
                    WHEN ?4 IS NULL THEN last_handshake
                    WHEN last_handshake IS NULL OR ?4 > last_handshake THEN ?4
                    ELSE last_handshake
                END
             WHERE id = ?1",
            params![id.to_string(), to_sql_int(rx), to_sql_int(tx), last_handshake],
        )?;
        Ok(n > 0)
    }

    pub fn reset_counters(&self, id: Uuid) -> rusqlite::Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE peers SET total_rx = 0, total_tx = 0 WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(n > 0)
    }

    /// Bumps the usage counter when a profile is fetched.
    pub fn record_usage(&self, id: Uuid, at: i64) -> rusqlite::Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE peers SET last_used = ?2, usage_count = usage_count + 1 WHERE id = ?1",
            params![id.to_string(), at],
        )?;
        Ok(n > 0)
    }
}

pub fn now_epoch_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
