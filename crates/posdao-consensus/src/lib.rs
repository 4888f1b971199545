/// POSDAO CONSENSUS
///
/// The validator side of the epoch engine:
/// - Epoch phase timeline (Regular -> Transition -> Ended -> next epoch)
/// - Committee sizing and stake x score weighted election
/// - Validator rotation: availability, bans, the epoch handoff and key generation retries
/// - Connectivity fault tracking with early epoch end
/// - `EpochEngine`, the per-block orchestrator over all five components
///
/// Time only enters through `BlockContext`; nothing here reads a clock or
/// runs in the background.

pub mod epoch;
pub mod committee;
pub mod block_history;
pub mod key_gen;
pub mod validator_set;
pub mod connectivity;
pub mod config;
pub mod engine;

pub use epoch::EpochPhase;
pub use committee::{elect_weighted, CommitteeSizing, SizingError};
pub use block_history::{BlockHistory, BLOCK_HISTORY_LEN};
pub use key_gen::{InstantKeyGen, KeyGenHistory, RecordedKeyGen};
pub use validator_set::{FinalizeOutcome, RotationError, RotationParams, ValidatorRotation};
pub use connectivity::{
    fault_quorum, ConnectivityError, ConnectivityParams, ConnectivityTracker, ReportEnv, ReportOutcome,
};
pub use config::{ConfigError, EngineConfig, GenesisValidator};
pub use engine::{BlockOutcome, EngineError, EpochEngine, SharedEngine};
