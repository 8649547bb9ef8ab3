//! Execution context configuration

use crate::error::{ErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

pub const BACKEND_VAR: &str = "MATGRAPH_BACKEND";
pub const SEED_VAR: &str = "MATGRAPH_SEED";

/// Which compute backend the execution context opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// ndarray on the host, deterministic
    #[default]
    Cpu,
    Wgpu,
}

impl FromStr for BackendKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(BackendKind::Cpu),
            "wgpu" | "gpu" => Ok(BackendKind::Wgpu),
            other => Err(ErrorKind::Config(format!("unknown backend {other:?}")).into()),
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Cpu => write!(f, "cpu"),
            BackendKind::Wgpu => write!(f, "wgpu"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Seed for `random` initialization. Entropy when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl ContextConfig {
    pub fn cpu() -> Self {
        Self::default()
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Read `MATGRAPH_BACKEND` and `MATGRAPH_SEED`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let backend = match var(BACKEND_VAR) {
            Some(v) => v.parse()?,
            None => BackendKind::default(),
        };
        let seed = match var(SEED_VAR) {
            Some(v) => Some(v.trim().parse::<u64>().map_err(|e| {
                ErrorKind::Config(format!("{SEED_VAR}={v:?} is not a seed: {e}"))
            })?),
            None => None,
        };
        Ok(Self { backend, seed })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |k| {
            vars.iter()
                .find(|(name, _)| *name == k)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_defaults() {
        let c = ContextConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(c, ContextConfig::cpu());
        assert_eq!(c.backend, BackendKind::Cpu);
        assert_eq!(c.seed, None);
    }

    #[test]
    fn test_parse_vars() {
        let c = ContextConfig::from_lookup(lookup(&[(BACKEND_VAR, " WGPU "), (SEED_VAR, "42")]))
            .unwrap();
        assert_eq!(c.backend, BackendKind::Wgpu);
        assert_eq!(c.seed, Some(42));
    }

    #[test]
    fn test_bad_values() {
        let err = ContextConfig::from_lookup(lookup(&[(BACKEND_VAR, "tpu")])).unwrap_err();
        assert!(matches!(*err, ErrorKind::Config(_)));
        let err = ContextConfig::from_lookup(lookup(&[(SEED_VAR, "-1")])).unwrap_err();
        assert!(matches!(*err, ErrorKind::Config(_)));
    }

    #[test]
    fn test_json_form() {
        let c: ContextConfig = serde_json::from_str(r#"{"backend":"cpu","seed":7}"#).unwrap();
        assert_eq!(c, ContextConfig::cpu().with_seed(7));
        let c: ContextConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(c, ContextConfig::default());
    }
}
