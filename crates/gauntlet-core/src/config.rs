use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{GauntletError, Result};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GauntletConfig {
    pub general: GeneralConfig,
    pub analyzer: AnalyzerConfig,
    pub repos: Vec<RepoConfig>,
}

impl GauntletConfig {
    /// Load config from a specific `gauntlet.toml` file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| GauntletError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| GauntletError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `./gauntlet.toml` if it exists, otherwise return defaults.
    pub fn load_or_default() -> Self {
        let path = PathBuf::from("gauntlet.toml");
        if path.exists() {
            match Self::load(&path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(%e, "failed to load gauntlet.toml, falling back to defaults");
                    Self::default()
                }
            }
        } else {
            Self::default()
        }
    }

    /// Validate the config and return actionable error messages.
    pub fn validate(&self) -> Result<()> {
        if self.general.parallel_workers == 0 {
            return Err(GauntletError::Config(
                "general.parallel_workers must be > 0".into(),
            ));
        }
        if self.general.run_count == 0 {
            return Err(GauntletError::Config("general.run_count must be > 0".into()));
        }

        if self.analyzer.binary_path.as_os_str().is_empty() {
            return Err(GauntletError::Config(
                "analyzer.binary_path must be set".into(),
            ));
        }
        if self.analyzer.indexer_path.as_os_str().is_empty() {
            return Err(GauntletError::Config(
                "analyzer.indexer_path must be set".into(),
            ));
        }
        if self.analyzer.index_path_env.trim().is_empty() {
            return Err(GauntletError::Config(
                "analyzer.index_path_env must not be empty".into(),
            ));
        }

        for (i, repo) in self.repos.iter().enumerate() {
            if repo.repo_path.as_os_str().is_empty() {
                return Err(GauntletError::Config(format!(
                    "repos[{i}].repo_path must be set"
                )));
            }
            if repo.inputs_path.as_os_str().is_empty() {
                return Err(GauntletError::Config(format!(
                    "repos[{i}].inputs_path must be set"
                )));
            }
            if repo.output_path.as_os_str().is_empty() {
                return Err(GauntletError::Config(format!(
                    "repos[{i}].output_path must be set"
                )));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GeneralConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Worker pool size used within a single repository.
    pub parallel_workers: usize,
    /// How many times each input file is run.
    pub run_count: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            parallel_workers: 3,
            run_count: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// AnalyzerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Path to the analyzer binary.
    pub binary_path: PathBuf,
    /// Analyzer config file passed with `-c`.
    pub config_path: PathBuf,
    /// Path to the index-building companion binary.
    pub indexer_path: PathBuf,
    /// Environment variable the analyzer reads the index location from.
    pub index_path_env: String,
    /// Extra environment for analyzer and indexer invocations (API keys and
    /// the like).
    pub env: BTreeMap<String, String>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::new(),
            config_path: PathBuf::new(),
            indexer_path: PathBuf::new(),
            index_path_env: "ANALYZER_INDEX_PATH".into(),
            env: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// RepoConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    pub repo_path: PathBuf,
    pub inputs_path: PathBuf,
    pub output_path: PathBuf,
    /// Branch to check out before running this repository's tests.
    pub branch: Option<String>,
}

impl RepoConfig {
    /// Short display name: the final path component of the repository path.
    pub fn repo_name(&self) -> String {
        self.repo_path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("repo")
            .to_string()
    }
}

// ---------------------------------------------------------------------------
// Input discovery
// ---------------------------------------------------------------------------

/// List the `*.txt` prompt files in an inputs directory, sorted by name.
pub fn list_input_files(inputs_path: &Path) -> Result<Vec<String>> {
    let entries = std::fs::read_dir(inputs_path).map_err(|e| {
        GauntletError::Config(format!(
            "failed to read inputs dir {}: {e}",
            inputs_path.display()
        ))
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("txt") {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                files.push(name.to_string());
            }
        }
    }
    files.sort();
    Ok(files)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Full, valid gauntlet.toml.
    const FULL_TOML: &str = r#"
[general]
parallel_workers = 4
run_count = 2

[analyzer]
binary_path = "/usr/local/bin/analyzer"
config_path = "/etc/analyzer/analyzer.toml"
indexer_path = "/usr/local/bin/code-indexer"
index_path_env = "CODE_INDEX"

[analyzer.env]
ANALYZER_API_KEY = "key-value"

[[repos]]
repo_path = "/work/repo-a"
inputs_path = "/work/repo-a-inputs"
output_path = "/work/results/repo-a"
branch = "release/v2"

[[repos]]
repo_path = "/work/repo-b"
inputs_path = "/work/repo-b-inputs"
output_path = "/work/results/repo-b"
"#;

    #[test]
    fn parse_full_toml() {
        let cfg: GauntletConfig = toml::from_str(FULL_TOML).expect("parse full TOML");
        assert_eq!(cfg.general.parallel_workers, 4);
        assert_eq!(cfg.general.run_count, 2);
        assert_eq!(
            cfg.analyzer.binary_path,
            PathBuf::from("/usr/local/bin/analyzer")
        );
        assert_eq!(cfg.analyzer.index_path_env, "CODE_INDEX");
        assert_eq!(cfg.analyzer.env["ANALYZER_API_KEY"], "key-value");
        assert_eq!(cfg.repos.len(), 2);
        assert_eq!(cfg.repos[0].branch.as_deref(), Some("release/v2"));
        assert!(cfg.repos[1].branch.is_none());
        cfg.validate().expect("full config is valid");
    }

    #[test]
    fn parse_minimal_toml_gets_defaults() {
        let cfg: GauntletConfig = toml::from_str("").expect("parse empty TOML");
        assert_eq!(cfg.general.parallel_workers, 3);
        assert_eq!(cfg.general.run_count, 1);
        assert_eq!(cfg.analyzer.index_path_env, "ANALYZER_INDEX_PATH");
        assert!(cfg.analyzer.env.is_empty());
        assert!(cfg.repos.is_empty());
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut cfg = valid_config();
        cfg.general.parallel_workers = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("parallel_workers"));
    }

    #[test]
    fn validate_rejects_zero_run_count() {
        let mut cfg = valid_config();
        cfg.general.run_count = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("run_count"));
    }

    #[test]
    fn validate_rejects_missing_binary() {
        let mut cfg = valid_config();
        cfg.analyzer.binary_path = PathBuf::new();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("binary_path"));
    }

    #[test]
    fn validate_rejects_empty_repo_paths() {
        let mut cfg = valid_config();
        cfg.repos.push(RepoConfig::default());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("repos[2]"));
    }

    #[test]
    fn repo_name_is_last_path_component() {
        let repo = RepoConfig {
            repo_path: PathBuf::from("/work/projects/widget"),
            ..RepoConfig::default()
        };
        assert_eq!(repo.repo_name(), "widget");
    }

    #[test]
    fn serialization_round_trip() {
        let original: GauntletConfig = toml::from_str(FULL_TOML).unwrap();
        let toml_str = toml::to_string_pretty(&original).expect("serialize");
        let restored: GauntletConfig = toml::from_str(&toml_str).expect("deserialize");

        assert_eq!(
            original.general.parallel_workers,
            restored.general.parallel_workers
        );
        assert_eq!(original.analyzer.binary_path, restored.analyzer.binary_path);
        assert_eq!(original.repos.len(), restored.repos.len());
        restored.validate().expect("round-tripped config is valid");
    }

    #[test]
    fn parse_invalid_toml_returns_error() {
        let bad = "this is not [valid toml";
        assert!(toml::from_str::<GauntletConfig>(bad).is_err());
    }

    #[test]
    fn lists_only_txt_files_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("b.txt"), "").unwrap();
        std::fs::write(tmp.path().join("a.txt"), "").unwrap();
        std::fs::write(tmp.path().join("notes.md"), "").unwrap();
        std::fs::create_dir(tmp.path().join("sub.txt.d")).unwrap();

        let files = list_input_files(tmp.path()).unwrap();
        assert_eq!(files, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn missing_inputs_dir_is_an_error() {
        let err = list_input_files(Path::new("/definitely/not/here")).unwrap_err();
        assert!(err.to_string().contains("inputs dir"));
    }

    fn valid_config() -> GauntletConfig {
        let mut cfg: GauntletConfig = toml::from_str(FULL_TOML).unwrap();
        cfg.validate().unwrap();
        cfg
    }
}
