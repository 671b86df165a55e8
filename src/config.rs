//! Immutable runtime configuration.
//!
//! One `Config` value is deserialized (or defaulted) at startup and threaded
//! through the component constructors; nothing reads configuration after
//! that. Tunables consumed inside relay loops are copied into per-stream
//! structs when the stream is built.
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::defs::{self, Definitions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Client,
    Server,
}

impl Mode {
    pub fn tag(self) -> &'static str {
        match self {
            Mode::Client => "client",
            Mode::Server => "server",
        }
    }
}

/// Knobs consumed by the relay workers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayTunables {
    /// Bytes pulled from a socket per read on the plaintext side.
    pub encoder_block_size: usize,
    /// Bytes pulled from a socket per read on the covert side.
    pub decoder_block_size: usize,
    /// Worker sleep between polls when there is no work, in milliseconds.
    pub clock_speed_ms: u64,
    /// Socket read timeout used to drain what's available, in milliseconds.
    pub select_speed_ms: u64,
    pub server_timeout_secs: u64,
    pub client_timeout_secs: u64,
    pub backlog: i32,
    pub nolinger: bool,
    pub forceful_shutdown: bool,
}

impl Default for RelayTunables {
    fn default() -> Self {
        Self {
            encoder_block_size: 4096,
            decoder_block_size: 4096,
            clock_speed_ms: 20,
            select_speed_ms: 10,
            server_timeout_secs: 30,
            client_timeout_secs: 30,
            backlog: 100,
            nolinger: false,
            forceful_shutdown: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 256-bit session key, 64 hex characters.
    pub key: String,
    pub upstream_language: String,
    pub downstream_language: String,
    pub relay: RelayTunables,
    pub negotiate_timeout_secs: u64,
    pub tcp_timeout_secs: u64,
    pub http_proxy_enable: bool,
    /// Directory for the pid file; `None` disables it.
    pub pid_dir: Option<PathBuf>,
    /// Optional path to a JSON definitions file replacing the embedded set.
    pub definitions_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key: "ffffffffffffffffffffffffffffffff00000000000000000000000000000000".into(),
            upstream_language: "http-request".into(),
            downstream_language: "http-response".into(),
            relay: RelayTunables::default(),
            negotiate_timeout_secs: 10,
            tcp_timeout_secs: 30,
            http_proxy_enable: false,
            pid_dir: None,
            definitions_file: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: Config = serde_json::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.session_key()?;
        anyhow::ensure!(
            self.upstream_language.ends_with(defs::REQUEST_SUFFIX),
            "upstream language {} must end with {}",
            self.upstream_language,
            defs::REQUEST_SUFFIX
        );
        anyhow::ensure!(
            self.downstream_language.ends_with(defs::RESPONSE_SUFFIX),
            "downstream language {} must end with {}",
            self.downstream_language,
            defs::RESPONSE_SUFFIX
        );
        anyhow::ensure!(
            defs::base_name(&self.upstream_language)
                == self
                    .downstream_language
                    .strip_suffix(defs::RESPONSE_SUFFIX)
                    .unwrap_or(""),
            "upstream/downstream languages must share a base name"
        );
        Ok(())
    }

    /// Decode the configured hex key into the 256-bit session key.
    pub fn session_key(&self) -> Result<[u8; 32]> {
        anyhow::ensure!(self.key.len() == 64, "key must be 64 hex characters");
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&self.key[i * 2..i * 2 + 2], 16)
                .context("key must be hex")?;
        }
        Ok(out)
    }

    /// Load the configured definitions file, or fall back to the embedded set.
    pub fn definitions(&self) -> Result<Definitions> {
        match &self.definitions_file {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("read definitions {}", path.display()))?;
                Definitions::from_json(&raw)
            }
            None => Ok(defs::load_definitions().clone()),
        }
    }
}

/// Handle to the `.{mode}-{pid}.pid` file; removed on drop.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn write(dir: &Path, mode: Mode) -> Result<Self> {
        let path = dir.join(format!(".{}-{}.pid", mode.tag(), process::id()));
        fs::write(&path, process::id().to_string())
            .with_context(|| format!("write pid file {}", path.display()))?;
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        let key = cfg.session_key().unwrap();
        assert_eq!(&key[..16], &[0xff; 16]);
        assert_eq!(&key[16..], &[0x00; 16]);
    }

    #[test]
    fn mismatched_language_pair_is_rejected() {
        let cfg = Config {
            upstream_language: "http-request".into(),
            downstream_language: "ftp-response".into(),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
