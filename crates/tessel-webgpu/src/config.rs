//! Backend configuration.
//!
//! Sources are layered with increasing priority:
//! 1. Built-in defaults
//! 2. A TOML document (`BackendConfig::from_toml_str` / `BackendConfig::load`)
//! 3. `TESSEL_WEBGPU_*` environment variables
//!
//! Unparseable environment values are logged and ignored.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

use crate::types::ShadingTarget;

pub const DEFAULT_DEFERRED_SUBMIT_BATCH_SIZE: usize = 15;
pub const DEFAULT_CPU_HANDOFF_SIZE_THRESHOLD: usize = 128;
pub const DEFAULT_WORKGROUP_SIZE: [u32; 3] = [64, 1, 1];
pub const MAX_DISPATCH_WORKGROUPS: u32 = 65_535;

pub const ENV_DEFERRED_SUBMIT_BATCH_SIZE: &str = "TESSEL_WEBGPU_DEFERRED_SUBMIT_BATCH_SIZE";
pub const ENV_CPU_FORWARD: &str = "TESSEL_WEBGPU_CPU_FORWARD";
pub const ENV_CPU_HANDOFF_SIZE_THRESHOLD: &str = "TESSEL_WEBGPU_CPU_HANDOFF_SIZE_THRESHOLD";
pub const ENV_USE_GLSL: &str = "TESSEL_WEBGPU_USE_GLSL";
pub const ENV_POWER_PREFERENCE: &str = "TESSEL_WEBGPU_POWER_PREFERENCE";
pub const ENV_WORKGROUP_SIZE: &str = "TESSEL_WEBGPU_WORKGROUP_SIZE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerPreference {
    #[default]
    HighPerformance,
    LowPower,
    None,
}

impl From<PowerPreference> for wgpu::PowerPreference {
    fn from(value: PowerPreference) -> Self {
        match value {
            PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
            PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
            PowerPreference::None => wgpu::PowerPreference::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BackendConfig {
    /// Compute passes recorded before the open encoder is submitted.
    pub deferred_submit_batch_size: usize,
    /// Let small host-resident workloads run on the CPU.
    pub cpu_forward: bool,
    /// Inputs smaller than this many elements qualify for CPU forwarding.
    pub cpu_handoff_size_threshold: usize,
    pub shading_language: ShadingTarget,
    pub power_preference: PowerPreference,
    pub force_fallback_adapter: bool,
    /// Default workgroup size for the reference programs.
    pub workgroup_size: [u32; 3],
    /// Upper bound per dispatch dimension; clamped to the device limit at startup.
    pub max_dispatch_per_dimension: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            deferred_submit_batch_size: DEFAULT_DEFERRED_SUBMIT_BATCH_SIZE,
            cpu_forward: true,
            cpu_handoff_size_threshold: DEFAULT_CPU_HANDOFF_SIZE_THRESHOLD,
            shading_language: ShadingTarget::Wgsl,
            power_preference: PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            workgroup_size: DEFAULT_WORKGROUP_SIZE,
            max_dispatch_per_dimension: MAX_DISPATCH_WORKGROUPS,
        }
    }
}

impl BackendConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: BackendConfig =
            toml::from_str(source).context("Failed to parse backend config (TOML)")?;
        Ok(config.normalized())
    }

    /// Read a TOML file, then apply environment overrides on top.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read backend config: {}", path.display()))?;
        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("Invalid backend config: {}", path.display()))?;
        config.apply_environment();
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_environment();
        config
    }

    pub fn apply_environment(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    /// Apply `TESSEL_WEBGPU_*` overrides using `lookup` as the variable source.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_DEFERRED_SUBMIT_BATCH_SIZE) {
            match raw.trim().parse::<usize>() {
                Ok(value) => self.deferred_submit_batch_size = value,
                Err(_) => warn!("ignoring {ENV_DEFERRED_SUBMIT_BATCH_SIZE}={raw:?}: not an integer"),
            }
        }
        if let Some(raw) = lookup(ENV_CPU_FORWARD) {
            match parse_bool(&raw) {
                Some(flag) => self.cpu_forward = flag,
                None => warn!("ignoring {ENV_CPU_FORWARD}={raw:?}: not a boolean"),
            }
        }
        if let Some(raw) = lookup(ENV_CPU_HANDOFF_SIZE_THRESHOLD) {
            match raw.trim().parse::<usize>() {
                Ok(value) => self.cpu_handoff_size_threshold = value,
                Err(_) => warn!("ignoring {ENV_CPU_HANDOFF_SIZE_THRESHOLD}={raw:?}: not an integer"),
            }
        }
        if let Some(raw) = lookup(ENV_USE_GLSL) {
            match parse_bool(&raw) {
                Some(true) => self.shading_language = ShadingTarget::Glsl,
                Some(false) => self.shading_language = ShadingTarget::Wgsl,
                None => warn!("ignoring {ENV_USE_GLSL}={raw:?}: not a boolean"),
            }
        }
        if let Some(raw) = lookup(ENV_POWER_PREFERENCE) {
            match parse_power_preference(&raw) {
                Some(pref) => self.power_preference = pref,
                None => warn!("ignoring {ENV_POWER_PREFERENCE}={raw:?}: expected high-performance, low-power or none"),
            }
        }
        if let Some(raw) = lookup(ENV_WORKGROUP_SIZE) {
            match parse_workgroup_size(&raw) {
                Some(size) => self.workgroup_size = size,
                None => warn!("ignoring {ENV_WORKGROUP_SIZE}={raw:?}: expected x[,y[,z]]"),
            }
        }
        *self = std::mem::take(self).normalized();
        debug!("backend config resolved: {self:?}");
    }

    pub fn normalized(mut self) -> Self {
        if self.deferred_submit_batch_size == 0 {
            warn!("deferred-submit-batch-size of 0 treated as 1");
            self.deferred_submit_batch_size = 1;
        }
        if self.workgroup_size.iter().any(|&d| d == 0) {
            warn!(
                "workgroup-size {:?} has a zero extent; using {:?}",
                self.workgroup_size, DEFAULT_WORKGROUP_SIZE
            );
            self.workgroup_size = DEFAULT_WORKGROUP_SIZE;
        }
        if self.max_dispatch_per_dimension == 0 {
            self.max_dispatch_per_dimension = MAX_DISPATCH_WORKGROUPS;
        }
        self
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn parse_power_preference(s: &str) -> Option<PowerPreference> {
    match s.trim().to_ascii_lowercase().as_str() {
        "high-performance" | "high" | "performance" => Some(PowerPreference::HighPerformance),
        "low-power" | "low" => Some(PowerPreference::LowPower),
        "none" | "default" => Some(PowerPreference::None),
        _ => None,
    }
}

fn parse_workgroup_size(s: &str) -> Option<[u32; 3]> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let mut size = [1u32; 3];
    for (slot, part) in size.iter_mut().zip(&parts) {
        let value: u32 = part.parse().ok()?;
        if value == 0 {
            return None;
        }
        *slot = value;
    }
    Some(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = BackendConfig::default();
        assert_eq!(config.deferred_submit_batch_size, 15);
        assert!(config.cpu_forward);
        assert_eq!(config.cpu_handoff_size_threshold, 128);
        assert_eq!(config.shading_language, ShadingTarget::Wgsl);
        assert_eq!(config.workgroup_size, [64, 1, 1]);
        assert_eq!(config.max_dispatch_per_dimension, 65_535);
    }

    #[test]
    fn toml_fields_are_kebab_case_and_partial() {
        let config = BackendConfig::from_toml_str(
            r#"
deferred-submit-batch-size = 4
shading-language = "glsl"
power-preference = "low-power"
"#,
        )
        .expect("parse");
        assert_eq!(config.deferred_submit_batch_size, 4);
        assert_eq!(config.shading_language, ShadingTarget::Glsl);
        assert_eq!(config.power_preference, PowerPreference::LowPower);
        assert!(config.cpu_forward);
    }

    #[test]
    fn env_overrides_win_and_bad_values_are_ignored() {
        let mut config = BackendConfig::from_toml_str("cpu-forward = false").expect("parse");
        config.apply_overrides(lookup(&[
            (ENV_CPU_FORWARD, "yes"),
            (ENV_DEFERRED_SUBMIT_BATCH_SIZE, "not-a-number"),
            (ENV_USE_GLSL, "1"),
            (ENV_WORKGROUP_SIZE, "8,8"),
        ]));
        assert!(config.cpu_forward);
        assert_eq!(config.deferred_submit_batch_size, 15);
        assert_eq!(config.shading_language, ShadingTarget::Glsl);
        assert_eq!(config.workgroup_size, [8, 8, 1]);
    }

    #[test]
    fn zero_batch_size_becomes_one() {
        let mut config = BackendConfig::default();
        config.apply_overrides(lookup(&[(ENV_DEFERRED_SUBMIT_BATCH_SIZE, "0")]));
        assert_eq!(config.deferred_submit_batch_size, 1);
    }

    #[test]
    fn workgroup_size_rejects_zero_and_extra_axes() {
        assert_eq!(parse_workgroup_size("0"), None);
        assert_eq!(parse_workgroup_size("1,2,3,4"), None);
        assert_eq!(parse_workgroup_size("256"), Some([256, 1, 1]));
    }
}
