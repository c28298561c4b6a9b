use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/iomark/iomark.toml";
const ENV_CONFIG_PATH: &str = "IOMARK_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `IOMARK_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned. Flags always win over the
    /// file.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DefaultsConfig {
    #[serde(default = "default_blocksize")]
    pub blocksize: usize,
    #[serde(default = "default_reqsize")]
    pub reqsize: usize,
    #[serde(default = "default_queuedepth")]
    pub queuedepth: usize,
    #[serde(default = "default_passes")]
    pub passes: u32,
    #[serde(default)]
    pub retry: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            blocksize: default_blocksize(),
            reqsize: default_reqsize(),
            queuedepth: default_queuedepth(),
            passes: default_passes(),
            retry: 0,
        }
    }
}

fn default_blocksize() -> usize {
    1024
}
fn default_reqsize() -> usize {
    128
}
fn default_queuedepth() -> usize {
    1
}
fn default_passes() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OutputConfig {
    /// Heartbeat log interval in seconds; absent disables it.
    #[serde(default)]
    pub heartbeat_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let cfg = Config::default();
        assert_eq!(cfg.defaults.blocksize, 1024);
        assert_eq!(cfg.defaults.reqsize, 128);
        assert_eq!(cfg.defaults.queuedepth, 1);
        assert!(cfg.output.heartbeat_secs.is_none());
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let cfg: Config = toml::from_str("[defaults]\nblocksize = 4096\n").unwrap();
        assert_eq!(cfg.defaults.blocksize, 4096);
        assert_eq!(cfg.defaults.reqsize, 128);
    }
}
