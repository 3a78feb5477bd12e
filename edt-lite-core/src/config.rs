use serde::{Deserialize, Serialize};

const ENV_CONFIG_PATH: &str = "EDT_LITE_CONFIG";

/// Platform shape: how many policy domains the process hosts and how each
/// one is provisioned. Tests build this literally; deployments may load it
/// from a JSON file named by `EDT_LITE_CONFIG`.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RuntimeConfig {
    #[serde(default = "default_pd_count")]
    pub pd_count: u16,
    #[serde(default = "default_workers_per_pd")]
    pub workers_per_pd: u32,
    /// Arity of the collective-event routing tree.
    #[serde(default = "default_collective_arity")]
    pub collective_arity: u32,
    /// Capture fixed-size trace records into the per-domain buffer.
    #[serde(default)]
    pub trace_enabled: bool,
    /// Dedicate one extra worker per domain to draining trace records.
    #[serde(default)]
    pub system_worker: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pd_count: default_pd_count(),
            workers_per_pd: default_workers_per_pd(),
            collective_arity: default_collective_arity(),
            trace_enabled: false,
            system_worker: false,
        }
    }
}

impl RuntimeConfig {
    /// Load from the file named by `EDT_LITE_CONFIG`, falling back to
    /// defaults when the file is missing or malformed.
    pub fn load() -> Self {
        match std::env::var(ENV_CONFIG_PATH) {
            Ok(path) => match std::fs::read_to_string(&path) {
                Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
                Err(_) => Self::default(),
            },
            Err(_) => Self::default(),
        }
    }

    pub fn single(workers: u32) -> Self {
        Self {
            pd_count: 1,
            workers_per_pd: workers,
            ..Self::default()
        }
    }

    pub fn multi(pds: u16, workers: u32) -> Self {
        Self {
            pd_count: pds,
            workers_per_pd: workers,
            ..Self::default()
        }
    }
}

fn default_pd_count() -> u16 {
    1
}
fn default_workers_per_pd() -> u32 {
    2
}
fn default_collective_arity() -> u32 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = RuntimeConfig::default();
        assert_eq!(c.pd_count, 1);
        assert_eq!(c.workers_per_pd, 2);
        assert!(!c.trace_enabled);
    }

    #[test]
    fn json_round_trip() {
        let c = RuntimeConfig::multi(4, 3);
        let s = serde_json::to_string(&c).unwrap();
        let back: RuntimeConfig = serde_json::from_str(&s).unwrap();
        assert_eq!(back.pd_count, 4);
        assert_eq!(back.workers_per_pd, 3);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let back: RuntimeConfig = serde_json::from_str(r#"{"pd_count": 2}"#).unwrap();
        assert_eq!(back.pd_count, 2);
        assert_eq!(back.workers_per_pd, 2);
    }
}
