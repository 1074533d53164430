//! Operation engine: trigger evaluation, step validation, reward application,
//! and per-player filesystem overlay composition.

pub mod clock;
pub mod engine;
pub mod filesystem;
pub mod flags;
pub mod ledger;
pub mod narrative;
pub mod registry;
pub mod reward;
pub mod state;
pub mod step;
pub mod trigger;

pub use clock::{Clock, FixedClock, SystemClock};
pub use engine::{CascadeReport, EngineError, OperationEngine};
pub use filesystem::{normalize_path, CatalogError, ComposedView, HostCatalog};
pub use flags::FlagStore;
pub use ledger::{CreditsLedger, LedgerError};
pub use registry::{OperationRegistry, RegistryError};
pub use reward::{RewardApplier, RewardError, RewardReceipt};
pub use state::{ActiveOperation, JournalRecord, PlayerProgressState, TerminalSession};
pub use step::{ObservedAction, StepValidator};
pub use trigger::TriggerEvaluator;
