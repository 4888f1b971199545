/// POSDAO
///
/// Epoch economics and validator rotation for an HBBFT committee:
/// - `posdao_core`: addresses, block context, epoch clock, bounded parameters
/// - `posdao_economics`: stake ledger, reward pots, bonus scores
/// - `posdao_consensus`: validator rotation, connectivity tracking, the `EpochEngine`
///
/// Consensus drivers normally only need `start_engine` and the prelude.

pub use posdao_consensus;
pub use posdao_core;
pub use posdao_economics;

use log::info;
use posdao_consensus::{EngineConfig, EngineError, EpochEngine, SharedEngine};
use posdao_core::BlockContext;

pub mod prelude {
    pub use posdao_consensus::{
        BlockOutcome, EngineConfig, EngineError, EpochEngine, EpochPhase, GenesisValidator, InstantKeyGen,
        KeyGenHistory, RecordedKeyGen, ReportOutcome, SharedEngine,
    };
    pub use posdao_core::{
        component, Address, Amount, BlockContext, BlockHash, EpochNumber, EpochSettings, Timestamp, SYSTEM_ADDRESS,
    };
    pub use posdao_economics::{
        BonusScoreParams, RewardParams, StakingParams, MAX_SCORE, MIN_SCORE,
    };
}

/// Parse a JSON config, build the engine at `genesis` and wrap it for sharing.
pub fn start_engine(config_json: &str, genesis: BlockContext) -> Result<SharedEngine, EngineError> {
    let config = EngineConfig::from_json(config_json)?;
    let validators = config.genesis_validators.len();
    let engine = EpochEngine::genesis(config, genesis)?;
    info!("Engine ready at block {} with {} validators", genesis.number, validators);
    Ok(engine.into_shared())
}
