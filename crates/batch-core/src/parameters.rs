//! Job parameters and their validation
//!
//! A run is identified by its job name plus the fingerprint of its
//! parameters, so two launches with the same key/value pairs address the same
//! job instance regardless of insertion order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use batch_common::fingerprint_pairs;

use crate::error::{BatchError, Result};

/// Immutable string-keyed parameters of one job launch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters(BTreeMap<String, String>);

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter, replacing any previous value for `key`
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| BatchError::invalid_parameters(format!("missing required parameter '{key}'")))
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        self.get(key)
            .map(|raw| {
                raw.trim().parse::<i64>().map_err(|_| {
                    BatchError::invalid_parameters(format!(
                        "parameter '{key}' must be an integer, got '{raw}'"
                    ))
                })
            })
            .transpose()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fingerprint identifying the job instance these parameters belong to
    pub fn identity_key(&self) -> String {
        fingerprint_pairs(self.0.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for JobParameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.to_string()))
                .collect(),
        )
    }
}

/// Checks parameters before any step of a job runs
pub trait JobParametersValidator: Send + Sync {
    fn validate(&self, parameters: &JobParameters) -> Result<()>;
}

/// Validates required keys and, when optional keys are declared, rejects
/// keys that are neither required nor optional.
#[derive(Debug, Clone, Default)]
pub struct DefaultJobParametersValidator {
    required_keys: Vec<String>,
    optional_keys: Vec<String>,
}

impl DefaultJobParametersValidator {
    pub fn new<R, O>(required_keys: R, optional_keys: O) -> Self
    where
        R: IntoIterator,
        R::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self {
            required_keys: required_keys.into_iter().map(Into::into).collect(),
            optional_keys: optional_keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl JobParametersValidator for DefaultJobParametersValidator {
    fn validate(&self, parameters: &JobParameters) -> Result<()> {
        let missing: Vec<&str> = self
            .required_keys
            .iter()
            .map(String::as_str)
            .filter(|key| parameters.require(key).is_err())
            .collect();
        if !missing.is_empty() {
            return Err(BatchError::invalid_parameters(format!(
                "missing required keys: {}",
                missing.join(", ")
            )));
        }

        if !self.optional_keys.is_empty() {
            let unknown: Vec<&str> = parameters
                .keys()
                .filter(|key| {
                    !self.required_keys.iter().any(|k| k == key)
                        && !self.optional_keys.iter().any(|k| k == key)
                })
                .collect();
            if !unknown.is_empty() {
                return Err(BatchError::invalid_parameters(format!(
                    "unrecognized keys: {}",
                    unknown.join(", ")
                )));
            }
        }

        Ok(())
    }
}
