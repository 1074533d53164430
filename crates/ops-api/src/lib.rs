//! In-process API facade over the operation engine with per-player
//! serialization and SQLite persistence.

mod persistence;
mod server;

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use contracts::{
    ActionParseError, ActiveOperationView, EngineConfig, FilesystemNode, HostRecord, InboxMessage,
    LedgerEntry, Operation, OperationEvent, PlayerAction, ProgressView, PublishReport,
    ValidationResult,
};
use ops_core::{
    CascadeReport, CatalogError, EngineError, OperationEngine, PlayerProgressState, RegistryError,
};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use persistence::SqliteOperationStore;
pub use persistence::PersistenceError;
pub use server::{default_sqlite_path, serve, ServerError};

/// In-memory audit events kept per player when no store is attached.
const EVENT_BUFFER_LIMIT: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum EngineApiError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Parse(#[from] ActionParseError),
    #[error("unknown host `{0}`")]
    UnknownHost(String),
}

#[derive(Debug)]
struct PlayerSlot {
    state: PlayerProgressState,
    events: VecDeque<OperationEvent>,
}

impl PlayerSlot {
    fn new(state: PlayerProgressState) -> Self {
        Self {
            state,
            events: VecDeque::new(),
        }
    }

    fn remember(&mut self, events: Vec<OperationEvent>) {
        self.events.extend(events);
        while self.events.len() > EVENT_BUFFER_LIMIT {
            let _ = self.events.pop_front();
        }
    }
}

/// Lock order is engine, then player map, then one player's slot. Mutating
/// calls hold the player's slot for the whole validate, reward, and cascade
/// pipeline so two submissions for one player never interleave.
#[derive(Debug)]
pub struct EngineApi {
    engine: RwLock<OperationEngine>,
    players: RwLock<BTreeMap<String, Arc<Mutex<PlayerSlot>>>>,
    store: Option<Mutex<SqliteOperationStore>>,
    last_persistence_error: Mutex<Option<String>>,
}

impl EngineApi {
    pub fn from_config(config: EngineConfig) -> Self {
        Self::from_engine(OperationEngine::new(config))
    }

    pub fn from_engine(engine: OperationEngine) -> Self {
        Self {
            engine: RwLock::new(engine),
            players: RwLock::new(BTreeMap::new()),
            store: None,
            last_persistence_error: Mutex::new(None),
        }
    }

    /// Opens the store and loads any hosts and operations it already holds.
    pub fn attach_sqlite_store(&mut self, path: impl AsRef<Path>) -> Result<(), EngineApiError> {
        let store = SqliteOperationStore::open(path)?;
        let hosts = store.load_hosts()?;
        let operations = store.load_operations()?;
        {
            let mut engine = self.engine.write();
            if !hosts.is_empty() {
                engine.register_hosts(hosts)?;
            }
            if !operations.is_empty() {
                engine.publish(operations)?;
            }
            info!(
                hosts = engine.catalog().len(),
                operations = engine.registry().len(),
                "sqlite store attached"
            );
        }
        self.store = Some(Mutex::new(store));
        self.players.write().clear();
        Ok(())
    }

    pub fn last_persistence_error(&self) -> Option<String> {
        self.last_persistence_error.lock().clone()
    }

    pub fn config(&self) -> EngineConfig {
        self.engine.read().config().clone()
    }

    pub fn publish_operations(
        &self,
        operations: Vec<Operation>,
    ) -> Result<PublishReport, EngineApiError> {
        let mut engine = self.engine.write();
        let report = engine.publish(operations)?;
        if let Some(store) = &self.store {
            let saved = store.lock().save_operations(engine.registry().iter());
            self.record_persistence(saved);
        }
        Ok(report)
    }

    pub fn list_operations(&self) -> Vec<Operation> {
        self.engine.read().registry().iter().cloned().collect()
    }

    pub fn register_hosts(&self, hosts: Vec<HostRecord>) -> Result<usize, EngineApiError> {
        let mut engine = self.engine.write();
        let count = engine.register_hosts(hosts)?;
        if let Some(store) = &self.store {
            let saved = store.lock().save_hosts(engine.catalog().hosts());
            self.record_persistence(saved);
        }
        Ok(count)
    }

    pub fn list_hosts(&self) -> Vec<HostRecord> {
        self.engine.read().catalog().hosts().cloned().collect()
    }

    pub fn open_session(&self, player_id: &str) -> CascadeReport {
        self.mutate_player(player_id, |engine, state| engine.open_session(state))
    }

    pub fn submit_action(&self, player_id: &str, action: &PlayerAction) -> ValidationResult {
        self.mutate_player(player_id, |engine, state| engine.submit_action(state, action))
    }

    /// Parses a terminal line from the fixed vocabulary and submits it.
    pub fn submit_command(
        &self,
        player_id: &str,
        line: &str,
    ) -> Result<ValidationResult, EngineApiError> {
        let action = line.parse::<PlayerAction>()?;
        Ok(self.submit_action(player_id, &action))
    }

    pub fn confirm_step(
        &self,
        player_id: &str,
        operation_id: &str,
    ) -> Result<ValidationResult, EngineApiError> {
        let result = self.mutate_player(player_id, |engine, state| {
            engine.confirm_step(state, operation_id)
        })?;
        Ok(result)
    }

    pub fn list_active_operations(&self, player_id: &str) -> Vec<ActiveOperationView> {
        self.read_player(player_id, |engine, state| engine.active_operations(state))
    }

    pub fn list_inbox_messages(&self, player_id: &str) -> Vec<InboxMessage> {
        self.read_player(player_id, |engine, state| engine.inbox(state))
    }

    pub fn resolve_filesystem(
        &self,
        player_id: &str,
        host_id: &str,
        path: &str,
    ) -> Result<Option<FilesystemNode>, EngineApiError> {
        self.read_player(player_id, |engine, state| {
            let node = engine.resolve_filesystem(state, host_id, path);
            if node.is_none() && !engine.catalog().contains(host_id) {
                return Err(EngineApiError::UnknownHost(host_id.to_string()));
            }
            Ok(node)
        })
    }

    pub fn get_progress_state(&self, player_id: &str) -> ProgressView {
        self.read_player(player_id, |engine, state| engine.progress(state))
    }

    /// Retained ledger entries, oldest first.
    pub fn ledger_entries(&self, player_id: &str) -> Result<Vec<LedgerEntry>, EngineApiError> {
        if let Some(store) = &self.store {
            let stored = store.lock().load_ledger(player_id)?;
            if !stored.is_empty() {
                return Ok(stored);
            }
        }
        Ok(self.read_player(player_id, |_, state| {
            state.ledger().entries().cloned().collect()
        }))
    }

    pub fn operation_events(
        &self,
        player_id: &str,
        after_sequence: u64,
        limit: usize,
    ) -> Result<Vec<OperationEvent>, EngineApiError> {
        if let Some(store) = &self.store {
            return Ok(store.lock().load_events(player_id, after_sequence, limit)?);
        }
        let Some(slot) = self.cached_slot(player_id) else {
            return Ok(Vec::new());
        };
        let slot = slot.lock();
        Ok(slot
            .events
            .iter()
            .filter(|event| event.sequence > after_sequence)
            .take(limit)
            .cloned()
            .collect())
    }

    fn mutate_player<T>(
        &self,
        player_id: &str,
        apply: impl FnOnce(&OperationEngine, &mut PlayerProgressState) -> T,
    ) -> T {
        let engine = self.engine.read();
        let slot = self.player_slot(&engine, player_id);
        let mut slot = slot.lock();

        let output = apply(&*engine, &mut slot.state);
        let events = slot.state.drain_events();
        if let Some(store) = &self.store {
            let saved = store.lock().persist_player(
                &slot.state,
                &events,
                engine.config().ledger_retention,
            );
            self.record_persistence(saved);
        }
        slot.remember(events);
        output
    }

    /// Reads never register a player. An unknown id is answered from a
    /// transient fresh record that is neither cached nor stored.
    fn read_player<T>(
        &self,
        player_id: &str,
        read: impl FnOnce(&OperationEngine, &PlayerProgressState) -> T,
    ) -> T {
        let engine = self.engine.read();
        if let Some(slot) = self.cached_slot(player_id) {
            let slot = slot.lock();
            return read(&*engine, &slot.state);
        }
        let state = self.load_player(&engine, player_id);
        read(&*engine, &state)
    }

    fn cached_slot(&self, player_id: &str) -> Option<Arc<Mutex<PlayerSlot>>> {
        self.players.read().get(player_id).map(Arc::clone)
    }

    /// Returns the player's slot, loading it from the store or creating a
    /// fresh progress record on first mutation.
    fn player_slot(&self, engine: &OperationEngine, player_id: &str) -> Arc<Mutex<PlayerSlot>> {
        if let Some(slot) = self.cached_slot(player_id) {
            return slot;
        }

        let mut players = self.players.write();
        if let Some(slot) = players.get(player_id) {
            return Arc::clone(slot);
        }

        let state = self.load_player(engine, player_id);
        let slot = Arc::new(Mutex::new(PlayerSlot::new(state)));
        players.insert(player_id.to_string(), Arc::clone(&slot));
        slot
    }

    /// Stored progress with the configured ledger retention applied, or a
    /// fresh record when the store has none.
    fn load_player(&self, engine: &OperationEngine, player_id: &str) -> PlayerProgressState {
        let loaded = match &self.store {
            Some(store) => match store.lock().load_player(player_id) {
                Ok(state) => state,
                Err(err) => {
                    warn!(player_id, error = %err, "failed to load player progress");
                    *self.last_persistence_error.lock() = Some(err.to_string());
                    None
                }
            },
            None => None,
        };
        match loaded {
            Some(mut state) => {
                state.set_ledger_retention(engine.config().ledger_retention);
                state
            }
            None => engine.new_player(player_id),
        }
    }

    fn record_persistence(&self, outcome: Result<(), PersistenceError>) {
        let mut last = self.last_persistence_error.lock();
        match outcome {
            Ok(()) => *last = None,
            Err(err) => {
                warn!(error = %err, "persistence write failed");
                *last = Some(err.to_string());
            }
        }
    }
}
