use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Tunables for a [`crate::CanConnection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Upper bound on one blocking read by the dispatch thread. The bus lock
    /// is held for at most this long, and a stop request is noticed within it.
    pub read_timeout_ms: u64,
    /// Name of the dispatch thread.
    pub thread_name: String,
    /// Request a bit rate switch on transmitted FD frames.
    pub bitrate_switch: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 20,
            thread_name: "can-dispatch".to_string(),
            bitrate_switch: false,
        }
    }
}

pub fn load_config_file(path: impl AsRef<Path>) -> anyhow::Result<ConnectionConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading connection config: {}", path.display()))?;
    let cfg: ConnectionConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing yaml: {}", path.display()))?;
    if cfg.read_timeout_ms == 0 {
        anyhow::bail!("read_timeout_ms must be non-zero: {}", path.display());
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let cfg: ConnectionConfig = serde_yaml::from_str("read_timeout_ms: 5\n").unwrap();
        assert_eq!(cfg.read_timeout_ms, 5);
        assert_eq!(cfg.thread_name, "can-dispatch");
        assert!(!cfg.bitrate_switch);
    }

    #[test]
    fn test_load_rejects_zero_timeout() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!("canmux-cfg-{}.yaml", std::process::id()));
        fs::write(&path, "read_timeout_ms: 0\n")?;
        let res = load_config_file(&path);
        let _ = fs::remove_file(&path);
        assert!(res.is_err());
        Ok(())
    }
}
