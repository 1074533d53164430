use std::path::Path;

use contracts::{HostRecord, LedgerEntry, Operation, OperationEvent};
use ops_core::PlayerProgressState;
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct SqliteOperationStore {
    conn: Connection,
}

impl SqliteOperationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        let mut store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    /// Rewrites the registry in declared order.
    pub fn save_operations<'a>(
        &mut self,
        operations: impl IntoIterator<Item = &'a Operation>,
    ) -> Result<(), PersistenceError> {
        let tx = self.conn.transaction()?;
        for (declared_order, operation) in operations.into_iter().enumerate() {
            let definition_json = serde_json::to_string(operation)?;
            tx.execute(
                "INSERT INTO operations (
                    operation_id,
                    version,
                    declared_order,
                    status,
                    definition_json
                 ) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(operation_id) DO UPDATE SET
                    version = excluded.version,
                    declared_order = excluded.declared_order,
                    status = excluded.status,
                    definition_json = excluded.definition_json",
                params![
                    operation.id.as_str(),
                    i64::from(operation.version),
                    i64::try_from(declared_order).unwrap_or(i64::MAX),
                    if operation.is_published() { "published" } else { "draft" },
                    definition_json,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_operations(&self) -> Result<Vec<Operation>, PersistenceError> {
        let mut stmt = self.conn.prepare(
            "SELECT definition_json
             FROM operations
             ORDER BY declared_order ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut operations = Vec::new();
        for row in rows {
            let payload = row?;
            operations.push(serde_json::from_str::<Operation>(&payload)?);
        }
        Ok(operations)
    }

    pub fn save_hosts<'a>(
        &mut self,
        hosts: impl IntoIterator<Item = &'a HostRecord>,
    ) -> Result<(), PersistenceError> {
        let tx = self.conn.transaction()?;
        for host in hosts {
            let record_json = serde_json::to_string(host)?;
            tx.execute(
                "INSERT INTO hosts (host_id, ip, record_json) VALUES (?1, ?2, ?3)
                 ON CONFLICT(host_id) DO UPDATE SET
                    ip = excluded.ip,
                    record_json = excluded.record_json",
                params![host.host_id.as_str(), host.ip.as_str(), record_json],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_hosts(&self) -> Result<Vec<HostRecord>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT record_json FROM hosts ORDER BY host_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut hosts = Vec::new();
        for row in rows {
            let payload = row?;
            hosts.push(serde_json::from_str::<HostRecord>(&payload)?);
        }
        Ok(hosts)
    }

    /// Writes the player's progress record, appends new ledger entries and
    /// audit events, and prunes the ledger to `retention` newest rows.
    pub fn persist_player(
        &mut self,
        state: &PlayerProgressState,
        events: &[OperationEvent],
        retention: usize,
    ) -> Result<(), PersistenceError> {
        let tx = self.conn.transaction()?;
        let progress_json = serde_json::to_string(state)?;
        let updated_at = events
            .last()
            .map(|event| event.created_at.to_rfc3339())
            .unwrap_or_default();

        tx.execute(
            "INSERT INTO players (player_id, credits, progress_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(player_id) DO UPDATE SET
                credits = excluded.credits,
                progress_json = excluded.progress_json,
                updated_at = CASE WHEN excluded.updated_at = '' THEN players.updated_at
                                  ELSE excluded.updated_at END",
            params![
                state.player_id(),
                state.credits(),
                progress_json,
                updated_at
            ],
        )?;

        for entry in state.ledger().entries() {
            tx.execute(
                "INSERT OR IGNORE INTO ledger_entries (
                    player_id,
                    entry_id,
                    amount,
                    reason,
                    balance_after,
                    created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    state.player_id(),
                    i64::try_from(entry.id).unwrap_or(i64::MAX),
                    entry.amount,
                    entry.reason.as_str(),
                    entry.balance_after,
                    entry.timestamp.to_rfc3339(),
                ],
            )?;
        }
        tx.execute(
            "DELETE FROM ledger_entries
             WHERE player_id = ?1 AND entry_id NOT IN (
                SELECT entry_id FROM ledger_entries
                WHERE player_id = ?1
                ORDER BY entry_id DESC
                LIMIT ?2
             )",
            params![
                state.player_id(),
                i64::try_from(retention.max(1)).unwrap_or(i64::MAX)
            ],
        )?;

        for event in events {
            let payload_json = serde_json::to_string(event)?;
            let event_type = serde_json::to_string(&event.event_type)?
                .trim_matches('"')
                .to_string();
            tx.execute(
                "INSERT OR IGNORE INTO operation_events (
                    player_id,
                    sequence,
                    event_type,
                    operation_id,
                    payload_json,
                    created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.player_id.as_str(),
                    i64::try_from(event.sequence).unwrap_or(i64::MAX),
                    event_type,
                    event.operation_id.as_deref(),
                    payload_json,
                    event.created_at.to_rfc3339(),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn load_player(&self, player_id: &str) -> Result<Option<PlayerProgressState>, PersistenceError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT progress_json FROM players WHERE player_id = ?1",
                params![player_id],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(raw) => Ok(Some(serde_json::from_str::<PlayerProgressState>(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn load_ledger(&self, player_id: &str) -> Result<Vec<LedgerEntry>, PersistenceError> {
        let mut stmt = self.conn.prepare(
            "SELECT entry_id, amount, reason, balance_after, created_at
             FROM ledger_entries
             WHERE player_id = ?1
             ORDER BY entry_id ASC",
        )?;
        let rows = stmt.query_map(params![player_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, amount, reason, balance_after, created_at) = row?;
            let timestamp = chrono::DateTime::parse_from_rfc3339(&created_at)
                .map(|stamp| stamp.with_timezone(&chrono::Utc))
                .map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        4,
                        rusqlite::types::Type::Text,
                        Box::new(err),
                    )
                })?;
            entries.push(LedgerEntry {
                id: u64::try_from(id).unwrap_or_default(),
                amount,
                reason,
                balance_after,
                timestamp,
            });
        }
        Ok(entries)
    }

    pub fn load_events(
        &self,
        player_id: &str,
        after_sequence: u64,
        limit: usize,
    ) -> Result<Vec<OperationEvent>, PersistenceError> {
        let mut stmt = self.conn.prepare(
            "SELECT payload_json
             FROM operation_events
             WHERE player_id = ?1 AND sequence > ?2
             ORDER BY sequence ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![
                player_id,
                i64::try_from(after_sequence).unwrap_or(i64::MAX),
                i64::try_from(limit).unwrap_or(i64::MAX)
            ],
            |row| row.get::<_, String>(0),
        )?;

        let mut events = Vec::new();
        for row in rows {
            let payload = row?;
            events.push(serde_json::from_str::<OperationEvent>(&payload)?);
        }
        Ok(events)
    }

    fn configure(&mut self) -> Result<(), PersistenceError> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    fn migrate(&mut self) -> Result<(), PersistenceError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS operations (
                operation_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                declared_order INTEGER NOT NULL,
                status TEXT NOT NULL,
                definition_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS hosts (
                host_id TEXT PRIMARY KEY,
                ip TEXT NOT NULL,
                record_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS players (
                player_id TEXT PRIMARY KEY,
                credits INTEGER NOT NULL,
                progress_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ledger_entries (
                player_id TEXT NOT NULL,
                entry_id INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                reason TEXT NOT NULL,
                balance_after INTEGER NOT NULL CHECK (balance_after >= 0),
                created_at TEXT NOT NULL,
                PRIMARY KEY (player_id, entry_id)
            );

            CREATE TABLE IF NOT EXISTS operation_events (
                player_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                operation_id TEXT,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (player_id, sequence)
            );

            CREATE INDEX IF NOT EXISTS idx_operations_order ON operations(declared_order);
            CREATE INDEX IF NOT EXISTS idx_events_player_type ON operation_events(player_id, event_type);
            ",
        )?;

        self.conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, name) VALUES(1, 'initial_v1')",
            [],
        )?;

        Ok(())
    }
}
