/// POSDAO CORE
///
/// Shared vocabulary for the epoch economics and validator rotation engine:
/// addresses and block context, the epoch clock, the bounded-parameter
/// registry, the non-reentrancy guard and the read-only seams components
/// use to see each other.

pub mod types;
pub mod epoch;
pub mod bounded_params;
pub mod guard;
pub mod math;
pub mod seams;

pub use types::{
    component, Address, Amount, BlockContext, BlockHash, EpochNumber, Timestamp, TypeParseError,
    SYSTEM_ADDRESS,
};
pub use epoch::{EpochClock, EpochConfigError, EpochSettings};
pub use bounded_params::{decade_ladder, stepped_table, BoundedParams, ParamChange, ParamError, ParamValue};
pub use guard::{Guarded, NonReentrant, ReentrancyError};
pub use math::{mul_div, percent_of};
pub use seams::{FlatScore, NoValidators, ScoreSource, ValidatorStatus};
