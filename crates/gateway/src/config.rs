use std::collections::HashMap;
use std::time::Duration;

/// Environment variable through which a parent process hands a serialized
/// [`GatewayConfig`] to a child, so the child can rebuild a streamer without
/// holding a direct reference.
pub const ENV_STREAMER_ARGS: &str = "GATEWAY_STREAMER_ARGS";

/// Static configuration of a gateway streamer: the deployment topology,
/// executor addresses, and client-side streaming behavior.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct GatewayConfig {
    /// Adjacency map of the deployment topology. Two sentinel names are
    /// reserved: "start" (source) and "end" (sink). Entry order is
    /// preserved: it breaks ties when fan-in branches merge.
    pub graph: indexmap::IndexMap<String, Vec<String>>,
    /// Replica addresses of each deployment, a single address or a list.
    pub executor_addresses: HashMap<String, Addresses>,
    /// Filter conditions evaluated over documents entering a deployment.
    #[serde(default)]
    pub graph_conditions: HashMap<String, serde_json::Value>,
    /// Key/value pairs attached as call metadata per deployment.
    #[serde(default)]
    pub deployments_metadata: HashMap<String, HashMap<String, String>>,
    /// Deployments which concatenate fan-in inputs instead of merging by id.
    #[serde(default)]
    pub deployments_no_reduce: Vec<String>,
    /// Bound on a single executor RPC.
    #[serde(default, with = "humantime_serde")]
    pub timeout_send: Option<Duration>,
    /// Transport-failure retries per send, each advancing the replica ring.
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub compression: Option<Compression>,
    /// Name under which this gateway reports metrics and logs.
    #[serde(default = "default_runtime_name")]
    pub runtime_name: String,
    /// Bound on concurrently in-flight requests per stream. Zero means
    /// unbounded.
    #[serde(default)]
    pub prefetch: usize,
}

fn default_runtime_name() -> String {
    "gateway".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            graph: indexmap::IndexMap::new(),
            executor_addresses: HashMap::new(),
            graph_conditions: HashMap::new(),
            deployments_metadata: HashMap::new(),
            deployments_no_reduce: Vec::new(),
            timeout_send: None,
            retries: 0,
            compression: None,
            runtime_name: default_runtime_name(),
            prefetch: 0,
        }
    }
}

impl GatewayConfig {
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|err| crate::Error::Config(err.to_string()))
    }

    /// Read a configuration previously published with [`GatewayConfig::to_env`].
    pub fn from_env() -> crate::Result<Self> {
        let raw = std::env::var(ENV_STREAMER_ARGS).map_err(|_| {
            crate::Error::Config(format!("{ENV_STREAMER_ARGS} environment variable is not set"))
        })?;
        Self::from_json(&raw)
    }

    /// Publish this configuration for child processes.
    pub fn to_env(&self) -> crate::Result<()> {
        let raw = serde_json::to_string(self).map_err(|err| crate::Error::Config(err.to_string()))?;
        std::env::set_var(ENV_STREAMER_ARGS, raw);
        Ok(())
    }
}

/// One or many replica addresses of a deployment.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Addresses {
    One(String),
    Many(Vec<String>),
}

impl Addresses {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        match self {
            Addresses::One(addr) => std::slice::from_ref(addr).iter(),
            Addresses::Many(addrs) => addrs.iter(),
        }
        .map(String::as_str)
    }
}

impl From<&str> for Addresses {
    fn from(addr: &str) -> Self {
        Addresses::One(addr.to_string())
    }
}

impl From<Vec<String>> for Addresses {
    fn from(addrs: Vec<String>) -> Self {
        Addresses::Many(addrs)
    }
}

/// Compression applied uniformly to executor calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Gzip,
    Zstd,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_json_round_trip() {
        let raw = serde_json::json!({
            "graph": {"start": ["a"], "a": ["end"]},
            "executor_addresses": {"a": ["grpc://10.0.0.1:8081", "grpc://10.0.0.2:8081"]},
            "deployments_no_reduce": ["a"],
            "timeout_send": "3s",
            "retries": 2,
            "compression": "gzip",
            "prefetch": 8,
        })
        .to_string();

        let config = GatewayConfig::from_json(&raw).unwrap();
        assert_eq!(config.retries, 2);
        assert_eq!(config.prefetch, 8);
        assert_eq!(config.timeout_send, Some(Duration::from_secs(3)));
        assert_eq!(config.compression, Some(Compression::Gzip));
        assert_eq!(config.runtime_name, "gateway");
        assert_eq!(
            config.executor_addresses["a"].iter().collect::<Vec<_>>(),
            vec!["grpc://10.0.0.1:8081", "grpc://10.0.0.2:8081"],
        );

        let echoed = serde_json::to_string(&config).unwrap();
        let config = GatewayConfig::from_json(&echoed).unwrap();
        assert_eq!(config.graph["start"], vec!["a"]);
    }

    #[test]
    fn single_address_form() {
        let config = GatewayConfig::from_json(
            r#"{"graph": {"start": ["a"], "a": ["end"]},
                "executor_addresses": {"a": "10.0.0.1:8081"}}"#,
        )
        .unwrap();
        assert_eq!(
            config.executor_addresses["a"].iter().collect::<Vec<_>>(),
            vec!["10.0.0.1:8081"],
        );
    }

    #[test]
    fn env_round_trip() {
        let mut config = GatewayConfig::default();
        config.graph.insert("start".to_string(), vec!["end".to_string()]);
        config.runtime_name = "env-test".to_string();
        config.to_env().unwrap();

        let echoed = GatewayConfig::from_env().unwrap();
        assert_eq!(echoed.runtime_name, "env-test");
        std::env::remove_var(ENV_STREAMER_ARGS);
    }
}
