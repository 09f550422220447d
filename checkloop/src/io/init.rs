//! Canonical `.checkloop/` paths and scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{EngineConfig, write_config};

/// All canonical paths within `.checkloop/` for a project root.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub root: PathBuf,
    pub engine_dir: PathBuf,
    pub state_dir: PathBuf,
    pub iterations_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub checkpoints_path: PathBuf,
    pub tasks_path: PathBuf,
}

impl EnginePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let engine_dir = root.join(".checkloop");
        let state_dir = engine_dir.join("state");
        Self {
            root: root.clone(),
            engine_dir: engine_dir.clone(),
            state_dir: state_dir.clone(),
            iterations_dir: engine_dir.join("iterations"),
            gitignore_path: engine_dir.join(".gitignore"),
            config_path: engine_dir.join("config.toml"),
            checkpoints_path: state_dir.join("checkpoints.json"),
            tasks_path: state_dir.join("tasks.json"),
        }
    }

    /// Resolve a configured path against the project root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InitOptions {
    /// If true, overwrite existing engine-owned files.
    pub force: bool,
}

/// Create `.checkloop/` scaffolding in `root`.
///
/// Fails if `.checkloop/` already exists unless `options.force` is set. Stored
/// checkpoints and tasks are never touched.
pub fn init_engine(root: &Path, options: &InitOptions) -> Result<EnginePaths> {
    let paths = EnginePaths::new(root);
    if paths.engine_dir.exists() && !paths.engine_dir.is_dir() {
        return Err(anyhow!("init: .checkloop exists but is not a directory"));
    }
    if paths.engine_dir.exists() && !options.force {
        return Err(anyhow!(
            "init: .checkloop already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.engine_dir)?;
    create_dir(&paths.state_dir)?;
    create_dir(&paths.iterations_dir)?;

    fs::write(&paths.gitignore_path, ENGINE_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &EngineConfig::default())?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const ENGINE_GITIGNORE: &str = "state/\niterations/\n";
