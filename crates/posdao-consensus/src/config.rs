// ENGINE CONFIGURATION
// Everything fixed at genesis, loadable from JSON.
//
// SAFETY INVARIANTS:
// 1. A config that fails validate() never reaches the engine
// 2. Every bounded parameter starts on an entry of its allowed table
// 3. Genesis validators have distinct, non-zero staking and mining addresses

use crate::connectivity::ConnectivityParams;
use crate::validator_set::RotationParams;
use posdao_core::{Address, Amount, EpochConfigError, EpochSettings, ParamError};
use posdao_economics::{BonusScoreParams, RewardError, RewardParams, StakingParams};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("epoch settings: {0}")]
    Epoch(#[from] EpochConfigError),

    #[error("parameter: {0}")]
    Param(#[from] ParamError),

    #[error("reward parameters: {0}")]
    Reward(#[from] RewardError),

    #[error("committee sizing: {0}")]
    Sizing(#[from] crate::committee::SizingError),

    #[error("genesis validator set is empty")]
    NoGenesisValidators,

    #[error("genesis validator {0} is listed twice or reuses an address")]
    DuplicateGenesisValidator(Address),

    #[error("genesis validator uses the zero address")]
    ZeroAddress,

    #[error("owner address must be set")]
    ZeroOwner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub staking: Address,
    pub mining: Address,
    pub stake: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub epoch: EpochSettings,
    pub staking: StakingParams,
    pub reward: RewardParams,
    pub bonus: BonusScoreParams,
    pub rotation: RotationParams,
    pub connectivity: ConnectivityParams,

    /// May change bounded parameters and the governance address
    pub owner: Address,

    /// Only caller of ban_validator / remove_malicious_validators
    pub misbehavior_oracle: Address,

    pub genesis_validators: Vec<GenesisValidator>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            epoch: EpochSettings::default(),
            staking: StakingParams::default(),
            reward: RewardParams::default(),
            bonus: BonusScoreParams::default(),
            rotation: RotationParams::default(),
            connectivity: ConnectivityParams::default(),
            owner: Address::ZERO,
            misbehavior_oracle: Address::ZERO,
            genesis_validators: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate. Missing sections take their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.epoch.validate()?;
        self.staking.validate()?;
        self.reward.validate()?;
        self.bonus.validate()?;
        self.rotation.validate()?;
        self.connectivity.validate()?;
        if self.owner.is_zero() {
            return Err(ConfigError::ZeroOwner);
        }
        if self.genesis_validators.is_empty() {
            return Err(ConfigError::NoGenesisValidators);
        }
        let mut seen = BTreeSet::new();
        for v in &self.genesis_validators {
            if v.staking.is_zero() || v.mining.is_zero() {
                return Err(ConfigError::ZeroAddress);
            }
            if v.staking == v.mining || !seen.insert(v.staking) || !seen.insert(v.mining) {
                return Err(ConfigError::DuplicateGenesisValidator(v.mining));
            }
        }
        Ok(())
    }
}
