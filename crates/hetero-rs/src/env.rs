//! Process configuration for backend initialisation.
//!
//! Values come from `HETERO_*` environment variables or from a JSON document. Parsing is lenient
//! the same way everywhere: empty values fall back to defaults, booleans accept `1/true/yes/on`.

use std::env;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, BackendResult};
use crate::extra::OverlapPolicy;

pub const ENV_CPU_THREADS: &str = "HETERO_CPU_THREADS";
pub const ENV_MAIN_DEVICE: &str = "HETERO_MAIN_DEVICE";
pub const ENV_TENSOR_SPLIT: &str = "HETERO_TENSOR_SPLIT";
pub const ENV_REGISTER_HOST: &str = "HETERO_REGISTER_HOST";
pub const ENV_EXTRA_OPS: &str = "HETERO_EXTRA_OPS";
pub const ENV_OVERLAP_POLICY: &str = "HETERO_OVERLAP_POLICY";

static PROCESS_CONFIG: OnceLock<BackendConfig> = OnceLock::new();

/// Settings consumed by the backend-initialisation routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Worker count handed to the CPU backend for work sizing and kernel parallelism.
    pub cpu_threads: usize,
    /// Device that owns non-splittable tensors of a split buffer.
    pub main_device: usize,
    /// Per-device split proportions; normalised to sum to 1.0 when used.
    pub tensor_split: Option<Vec<f32>>,
    /// Allows callers to register external host memory with accelerator drivers.
    pub register_host: bool,
    /// Installs the default CPU extra-op providers.
    pub extra_ops: bool,
    pub overlap_policy: OverlapPolicy,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            cpu_threads: default_cpu_threads(),
            main_device: 0,
            tensor_split: None,
            register_host: false,
            extra_ops: true,
            overlap_policy: OverlapPolicy::default(),
        }
    }
}

impl BackendConfig {
    /// Reads configuration from the process environment.
    pub fn from_env() -> BackendResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads configuration through an arbitrary key lookup (environment, test fixtures, ...).
    pub fn from_lookup<F>(lookup: F) -> BackendResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let value = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(raw) = value(ENV_CPU_THREADS) {
            config.cpu_threads = parse_usize(ENV_CPU_THREADS, &raw)?.max(1);
        }
        if let Some(raw) = value(ENV_MAIN_DEVICE) {
            config.main_device = parse_usize(ENV_MAIN_DEVICE, &raw)?;
        }
        if let Some(raw) = value(ENV_TENSOR_SPLIT) {
            config.tensor_split = Some(parse_split(&raw)?);
        }
        if let Some(raw) = value(ENV_REGISTER_HOST) {
            config.register_host = parse_bool(&raw);
        }
        if let Some(raw) = value(ENV_EXTRA_OPS) {
            config.extra_ops = parse_bool(&raw);
        }
        if let Some(raw) = value(ENV_OVERLAP_POLICY) {
            config.overlap_policy = raw.parse()?;
        }
        Ok(config)
    }

    pub fn from_json_str(src: &str) -> BackendResult<Self> {
        serde_json::from_str(src)
            .map_err(|err| BackendError::execution(format!("invalid backend config: {err}")))
    }

    /// Normalised split ratios for `device_count` devices, if a split was configured.
    ///
    /// Missing trailing entries count as zero so a short list keeps later devices idle.
    pub fn split_ratios(&self, device_count: usize) -> BackendResult<Option<Vec<f32>>> {
        let Some(weights) = &self.tensor_split else {
            return Ok(None);
        };
        if weights.len() > device_count {
            return Err(BackendError::invalid_split(format!(
                "{} split weights configured for {device_count} devices",
                weights.len()
            )));
        }
        let mut padded = weights.clone();
        padded.resize(device_count, 0.0);
        normalize_weights(&padded).map(Some)
    }
}

/// Configuration read once from the environment; falls back to defaults on parse errors.
pub fn process_config() -> &'static BackendConfig {
    PROCESS_CONFIG.get_or_init(|| match BackendConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("ignoring malformed backend environment: {err}");
            BackendConfig::default()
        }
    })
}

/// Scales non-negative weights so they sum to 1.0.
pub fn normalize_weights(weights: &[f32]) -> BackendResult<Vec<f32>> {
    if let Some(bad) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
        return Err(BackendError::invalid_split(format!(
            "split weight {bad} must be finite and non-negative"
        )));
    }
    let total: f32 = weights.iter().sum();
    if total <= 0.0 {
        return Err(BackendError::invalid_split("split weights sum to zero"));
    }
    Ok(weights.iter().map(|w| w / total).collect())
}

fn default_cpu_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub(crate) fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_usize(key: &str, raw: &str) -> BackendResult<usize> {
    raw.trim()
        .parse()
        .map_err(|_| BackendError::execution(format!("{key}: expected an integer, got {raw:?}")))
}

fn parse_split(raw: &str) -> BackendResult<Vec<f32>> {
    raw.split([',', '/'])
        .map(|part| {
            part.trim().parse::<f32>().map_err(|_| {
                BackendError::invalid_split(format!("{ENV_TENSOR_SPLIT}: bad weight {part:?}"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = BackendConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, BackendConfig::default());
        assert!(!config.register_host);
        assert!(config.extra_ops);
    }

    #[test]
    fn reads_every_variable() {
        let config = BackendConfig::from_lookup(lookup(&[
            (ENV_CPU_THREADS, "6"),
            (ENV_MAIN_DEVICE, "1"),
            (ENV_TENSOR_SPLIT, "3,1"),
            (ENV_REGISTER_HOST, "Yes"),
            (ENV_EXTRA_OPS, "off"),
            (ENV_OVERLAP_POLICY, "reject"),
        ]))
        .unwrap();
        assert_eq!(config.cpu_threads, 6);
        assert_eq!(config.main_device, 1);
        assert_eq!(config.tensor_split, Some(vec![3.0, 1.0]));
        assert!(config.register_host);
        assert!(!config.extra_ops);
        assert_eq!(config.overlap_policy, OverlapPolicy::Reject);
        assert_eq!(config.split_ratios(2).unwrap(), Some(vec![0.75, 0.25]));
    }

    #[test]
    fn rejects_garbage_numbers() {
        assert!(BackendConfig::from_lookup(lookup(&[(ENV_CPU_THREADS, "many")])).is_err());
        assert!(BackendConfig::from_lookup(lookup(&[(ENV_TENSOR_SPLIT, "1,x")])).is_err());
    }

    #[test]
    fn short_split_pads_with_zero() {
        let config = BackendConfig {
            tensor_split: Some(vec![1.0]),
            ..BackendConfig::default()
        };
        assert_eq!(config.split_ratios(3).unwrap(), Some(vec![1.0, 0.0, 0.0]));
        assert!(config.split_ratios(0).is_err());
    }

    #[test]
    fn parses_json_with_partial_fields() {
        let config = BackendConfig::from_json_str(r#"{"cpu_threads": 2, "overlap_policy": "first-wins"}"#)
            .unwrap();
        assert_eq!(config.cpu_threads, 2);
        assert_eq!(config.overlap_policy, OverlapPolicy::FirstWins);
        assert_eq!(config.main_device, 0);
    }
}
