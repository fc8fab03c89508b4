//! Orchestration readiness probes.
//!
//! When running under an orchestrator, a `ready` file in the state
//! directory backs the readiness probe. Outside one, probes are disabled
//! entirely.

use std::path::{Path, PathBuf};

use crate::config::RuntimeConfig;

pub struct ProbeHelper {
    root: PathBuf,
    enabled: bool,
}

impl ProbeHelper {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self::with_root(&config.state_dir, config.under_orchestrator)
    }

    fn with_root(root: &Path, under_orchestrator: bool) -> Self {
        if !under_orchestrator {
            tracing::debug!("Not running under an orchestrator, probes disabled");
            return Self {
                root: root.to_path_buf(),
                enabled: false,
            };
        }

        match std::fs::create_dir_all(root) {
            Ok(()) => Self {
                root: root.to_path_buf(),
                enabled: true,
            },
            Err(e) => {
                tracing::error!(
                    dir = %root.display(),
                    error = %e,
                    "Failed to create runtime state directory, probes disabled"
                );
                Self {
                    root: root.to_path_buf(),
                    enabled: false,
                }
            }
        }
    }

    /// Mark the runtime ready. Idempotent; errors are logged only.
    pub fn ready(&self) {
        if !self.enabled {
            return;
        }
        let file = self.root.join("ready");
        if file.exists() {
            return;
        }
        if let Err(e) = std::fs::write(&file, b"") {
            tracing::warn!(file = %file.display(), error = %e, "Failed to write readiness file");
        }
    }
}
