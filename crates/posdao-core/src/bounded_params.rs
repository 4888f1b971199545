// BOUNDED PARAMETERS
// Registry of runtime-tunable values, each restricted to a table of allowed values.
//
// SAFETY INVARIANTS:
// 1. A value can only move to a neighbouring entry of its allowed table per call
// 2. Allowed tables are strictly ascending and non-empty
// 3. A current value that is missing from its own table is an invariant violation,
//    never silently repaired
// 4. Unknown keys are rejected, not ignored

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Type for all bounded parameter values
pub type ParamValue = u128;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("unknown parameter: {0}")]
    UnknownParam(String),

    #[error("parameter {key} is already registered")]
    DuplicateParam { key: String },

    #[error("allowed table for {key} must be non-empty and strictly ascending")]
    InvalidTable { key: String },

    #[error("value {value} is not an allowed value for {key}")]
    NotAllowed { key: String, value: ParamValue },

    #[error("{key} can only move one step per change ({from} -> {to} rejected)")]
    StepTooLarge { key: String, from: ParamValue, to: ParamValue },

    #[error("{key} is already {value}")]
    Unchanged { key: String, value: ParamValue },

    #[error("current value {value} of {key} is outside its allowed table")]
    CurrentValueNotAllowed { key: String, value: ParamValue },
}

/// One registered parameter: how to read it, how to write it, where it may go.
pub struct BoundedEntry<T> {
    getter: fn(&T) -> ParamValue,
    setter: fn(&mut T, ParamValue),
    allowed: Vec<ParamValue>,
}

impl<T> Clone for BoundedEntry<T> {
    fn clone(&self) -> Self {
        BoundedEntry { getter: self.getter, setter: self.setter, allowed: self.allowed.clone() }
    }
}

impl<T> BoundedEntry<T> {
    pub fn allowed(&self) -> &[ParamValue] {
        &self.allowed
    }
}

/// Record of an applied change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamChange {
    pub key: String,
    pub from: ParamValue,
    pub to: ParamValue,
}

/// Registry keyed by parameter name, generic over the struct holding the values.
pub struct BoundedParams<T> {
    entries: BTreeMap<&'static str, BoundedEntry<T>>,
}

impl<T> Default for BoundedParams<T> {
    fn default() -> Self {
        BoundedParams { entries: BTreeMap::new() }
    }
}

impl<T> Clone for BoundedParams<T> {
    fn clone(&self) -> Self {
        BoundedParams { entries: self.entries.clone() }
    }
}

impl<T> fmt::Debug for BoundedParams<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, e)| (k, &e.allowed)))
            .finish()
    }
}

impl<T> BoundedParams<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter with its accessor pair and allowed table.
    pub fn register(
        mut self,
        key: &'static str,
        getter: fn(&T) -> ParamValue,
        setter: fn(&mut T, ParamValue),
        allowed: Vec<ParamValue>,
    ) -> Result<Self, ParamError> {
        if self.entries.contains_key(key) {
            return Err(ParamError::DuplicateParam { key: key.to_string() });
        }
        if allowed.is_empty() || allowed.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ParamError::InvalidTable { key: key.to_string() });
        }
        self.entries.insert(key, BoundedEntry { getter, setter, allowed });
        Ok(self)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    fn entry(&self, key: &str) -> Result<&BoundedEntry<T>, ParamError> {
        self.entries.get(key).ok_or_else(|| ParamError::UnknownParam(key.to_string()))
    }

    pub fn allowed_values(&self, key: &str) -> Result<&[ParamValue], ParamError> {
        Ok(self.entry(key)?.allowed())
    }

    pub fn get(&self, target: &T, key: &str) -> Result<ParamValue, ParamError> {
        Ok((self.entry(key)?.getter)(target))
    }

    /// Check that every registered parameter currently holds an allowed value.
    pub fn verify(&self, target: &T) -> Result<(), ParamError> {
        for (key, entry) in &self.entries {
            let value = (entry.getter)(target);
            if entry.allowed.binary_search(&value).is_err() {
                return Err(ParamError::CurrentValueNotAllowed { key: key.to_string(), value });
            }
        }
        Ok(())
    }

    /// Whether `new_value` is a legal single step from the current value.
    pub fn is_allowed_change(&self, target: &T, key: &str, new_value: ParamValue) -> bool {
        self.check_step(target, key, new_value).is_ok()
    }

    fn check_step(&self, target: &T, key: &str, new_value: ParamValue) -> Result<ParamValue, ParamError> {
        let entry = self.entry(key)?;
        let current = (entry.getter)(target);
        let from_idx = entry.allowed.binary_search(&current).map_err(|_| {
            ParamError::CurrentValueNotAllowed { key: key.to_string(), value: current }
        })?;
        let to_idx = entry
            .allowed
            .binary_search(&new_value)
            .map_err(|_| ParamError::NotAllowed { key: key.to_string(), value: new_value })?;

        if from_idx == to_idx {
            return Err(ParamError::Unchanged { key: key.to_string(), value: current });
        }
        if from_idx.abs_diff(to_idx) != 1 {
            return Err(ParamError::StepTooLarge { key: key.to_string(), from: current, to: new_value });
        }
        Ok(current)
    }

    /// Apply a single-step change.
    pub fn set(&self, target: &mut T, key: &str, new_value: ParamValue) -> Result<ParamChange, ParamError> {
        let current = match self.check_step(target, key, new_value) {
            Ok(current) => current,
            Err(e) => {
                warn!("Rejected change of {} to {}: {}", key, new_value, e);
                return Err(e);
            }
        };
        let entry = self.entry(key)?;
        (entry.setter)(target, new_value);
        info!("Parameter {} changed {} -> {}", key, current, new_value);
        Ok(ParamChange { key: key.to_string(), from: current, to: new_value })
    }
}

/// Evenly spaced table `start, start+step, ..., end` (inclusive).
pub fn stepped_table(start: ParamValue, end: ParamValue, step: ParamValue) -> Vec<ParamValue> {
    if step == 0 || start > end {
        return vec![start];
    }
    let mut out = Vec::new();
    let mut v = start;
    while v <= end {
        out.push(v);
        v = match v.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    out
}

/// `1, 2, 5, 10, 20, 50, ...` up to `10^max_exponent * 5`. Used for amount
/// thresholds that span many orders of magnitude.
pub fn decade_ladder(max_exponent: u32) -> Vec<ParamValue> {
    let mut out = Vec::new();
    for exp in 0..=max_exponent {
        let base = match 10u128.checked_pow(exp) {
            Some(base) => base,
            None => break,
        };
        for mult in [1u128, 2, 5] {
            if let Some(v) = base.checked_mul(mult) {
                out.push(v);
            }
        }
    }
    out
}
