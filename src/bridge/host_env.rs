//! Host capabilities granted to the guest
//!
//! The guest sees exactly two preopened directories (the configuration root
//! and the taskoo config directory inside it, each mapped to the same path)
//! and two environment variables: `RUST_LOG` and `HOME`.

use std::path::PathBuf;
use tracing::info;
use wasmtime_wasi::p2::WasiCtxBuilder;
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::{DirPerms, FilePerms};

use super::BridgeError;
use crate::config::GuestConfig;

/// Guest log filter when debug logging is on
pub const GUEST_DEBUG_LOG: &str = "debug";
/// Guest log filter otherwise
pub const GUEST_QUIET_LOG: &str = "warn";

/// Resolved view of the host handed to the guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEnvironment {
    pub config_root: PathBuf,
    pub app_config_dir: PathBuf,
    pub home: PathBuf,
    pub debug: bool,
}

impl HostEnvironment {
    pub fn from_config(config: &GuestConfig) -> Self {
        Self {
            config_root: config.resolved_config_root(),
            app_config_dir: config.resolved_app_config_dir(),
            home: config.home.clone(),
            debug: config.debug,
        }
    }

    /// Environment variables passed to the guest
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let log = if self.debug { GUEST_DEBUG_LOG } else { GUEST_QUIET_LOG };
        vec![
            ("RUST_LOG", log.to_string()),
            ("HOME", self.home.to_string_lossy().into_owned()),
        ]
    }

    /// Directories preopened for the guest, as (host path, guest path)
    pub fn preopens(&self) -> Vec<(PathBuf, String)> {
        [&self.config_root, &self.app_config_dir]
            .into_iter()
            .map(|dir| (dir.clone(), dir.to_string_lossy().into_owned()))
            .collect()
    }

    /// Build the WASI context. The taskoo config directory is created if
    /// missing, since the guest writes its database and config file there.
    pub fn build_wasi_ctx(&self) -> Result<WasiP1Ctx, BridgeError> {
        if !self.app_config_dir.exists() {
            std::fs::create_dir_all(&self.app_config_dir).map_err(|e| {
                BridgeError::HostEnvironment(format!(
                    "cannot create {}: {}",
                    self.app_config_dir.display(),
                    e
                ))
            })?;
            info!("Created guest config directory {}", self.app_config_dir.display());
        }

        let mut builder = WasiCtxBuilder::new();
        builder.inherit_stdio();
        for (key, value) in self.env_vars() {
            builder.env(key, value);
        }
        for (host, guest) in self.preopens() {
            builder
                .preopened_dir(&host, &guest, DirPerms::all(), FilePerms::all())
                .map_err(|e| {
                    BridgeError::HostEnvironment(format!("cannot preopen {}: {}", host.display(), e))
                })?;
        }
        Ok(builder.build_p1())
    }
}
