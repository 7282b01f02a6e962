use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable that overrides the data directory.
pub const HOME_ENV: &str = "ADVGEN_PRICES_HOME";

/// Locations of everything a node keeps on disk.
#[derive(Debug, Clone)]
pub struct AppPaths {
    root: PathBuf,
}

impl AppPaths {
    /// Resolves the data directory: `$ADVGEN_PRICES_HOME`, else `~/.advgen-prices/`.
    pub fn resolve() -> Result<Self> {
        if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::at(dir));
        }
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(Self::at(home.join(".advgen-prices")))
    }

    /// Uses an explicit root directory.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/config.json`
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// `<root>/servers.json`
    pub fn servers_path(&self) -> PathBuf {
        self.root.join("servers.json")
    }

    /// `<root>/prices.db`
    pub fn db_path(&self) -> PathBuf {
        self.root.join("prices.db")
    }

    /// `<root>/logs/`
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Ensures the root and log directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.root.clone(), self.logs_dir()] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
            }
        }
        Ok(())
    }
}
