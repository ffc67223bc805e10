use crate::mutator::MutationProbabilities;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Probability '{name}' must be within [0, 1], got {value}")]
    Probability { name: &'static str, value: f64 },
    #[error("'{0}' must be greater than zero")]
    Zero(&'static str),
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SessionSettings {
    #[serde(default = "default_time_budget_secs")]
    pub time_budget_secs: u64,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub max_trials: Option<u64>,
    #[serde(default = "default_random_input_len")]
    pub random_input_len: usize,
}

pub fn default_time_budget_secs() -> u64 {
    10
}

pub fn default_random_input_len() -> usize {
    64
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            time_budget_secs: default_time_budget_secs(),
            seed: None,
            max_trials: None,
            random_input_len: default_random_input_len(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    /// Each entry becomes a single text argument seed.
    #[serde(default = "default_literal_seeds")]
    pub literal_seeds: Vec<String>,
    #[serde(default)]
    pub seed_paths: Vec<PathBuf>,
    #[serde(default)]
    pub max_entries: Option<usize>,
    #[serde(default)]
    pub max_input_len: Option<usize>,
}

pub fn default_literal_seeds() -> Vec<String> {
    vec![
        "<html><body><p>hello</p></body></html>".to_string(),
        "<a href=\"x\">link</a>".to_string(),
        "<br/>".to_string(),
    ]
}

impl Default for CorpusSettings {
    fn default() -> Self {
        Self {
            literal_seeds: default_literal_seeds(),
            seed_paths: Vec::new(),
            max_entries: None,
            max_input_len: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ReportSettings {
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,
    #[serde(default)]
    pub instrumented_artifact_path: Option<PathBuf>,
}

pub fn default_report_dir() -> PathBuf {
    PathBuf::from("./covfuzz_reports")
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            report_dir: default_report_dir(),
            instrumented_artifact_path: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzConfig {
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub mutation: MutationProbabilities,
    #[serde(default)]
    pub corpus: CorpusSettings,
    #[serde(default)]
    pub report: ReportSettings,
}

impl FuzzConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: FuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid config file {:?}: {}", path, e))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let probabilities = [
            ("insert-tag-p", self.mutation.insert_tag_p),
            ("delete-tag-p", self.mutation.delete_tag_p),
            ("add-invalid-char-p", self.mutation.add_invalid_char_p),
        ];
        for (name, value) in probabilities {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Probability { name, value });
            }
        }
        if self.session.random_input_len == 0 {
            return Err(ConfigError::Zero("random-input-len"));
        }
        if self.session.max_trials == Some(0) {
            return Err(ConfigError::Zero("max-trials"));
        }
        if self.corpus.max_entries == Some(0) {
            return Err(ConfigError::Zero("max-entries"));
        }
        if self.corpus.max_input_len == Some(0) {
            return Err(ConfigError::Zero("max-input-len"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn defaults_apply_to_an_empty_file() {
        let config: FuzzConfig = toml::from_str("").unwrap();
        assert_eq!(config, FuzzConfig::default());
        assert_eq!(config.session.time_budget_secs, 10);
        assert_eq!(config.session.random_input_len, 64);
        assert_eq!(config.session.seed, None);
        assert_eq!(config.report.report_dir, PathBuf::from("./covfuzz_reports"));
        assert_eq!(config.corpus.literal_seeds.len(), 3);
        assert_eq!(config.mutation, MutationProbabilities::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_every_section() {
        let toml_str = r#"
            [session]
            time-budget-secs = 3
            seed = 1234
            max-trials = 500
            random-input-len = 16

            [mutation]
            insert-tag-p = 0.1
            delete-tag-p = 0.0
            add-invalid-char-p = 1.0

            [corpus]
            literal-seeds = ["<p>hello</p>"]
            seed-paths = ["./seeds"]
            max-entries = 128
            max-input-len = 512

            [report]
            report-dir = "/tmp/out"
            instrumented-artifact-path = "/tmp/out/unit.txt"
        "#;
        let config: FuzzConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.session.time_budget_secs, 3);
        assert_eq!(config.session.seed, Some(1234));
        assert_eq!(config.session.max_trials, Some(500));
        assert_eq!(config.session.random_input_len, 16);
        assert_eq!(config.mutation.insert_tag_p, 0.1);
        assert_eq!(config.mutation.delete_tag_p, 0.0);
        assert_eq!(config.mutation.add_invalid_char_p, 1.0);
        assert_eq!(config.corpus.literal_seeds, vec!["<p>hello</p>".to_string()]);
        assert_eq!(config.corpus.seed_paths, vec![PathBuf::from("./seeds")]);
        assert_eq!(config.corpus.max_entries, Some(128));
        assert_eq!(config.corpus.max_input_len, Some(512));
        assert_eq!(config.report.report_dir, PathBuf::from("/tmp/out"));
        assert_eq!(
            config.report.instrumented_artifact_path,
            Some(PathBuf::from("/tmp/out/unit.txt"))
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<FuzzConfig>("[session]\nthreads = 4\n").is_err());
        assert!(toml::from_str::<FuzzConfig>("[executor]\n").is_err());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = FuzzConfig::default();
        config.mutation.delete_tag_p = 1.5;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Probability {
                name: "delete-tag-p",
                value: 1.5
            })
        );

        let mut config = FuzzConfig::default();
        config.mutation.add_invalid_char_p = f64::NAN;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Probability { name: "add-invalid-char-p", .. })
        ));

        let mut config = FuzzConfig::default();
        config.session.random_input_len = 0;
        assert_eq!(config.validate(), Err(ConfigError::Zero("random-input-len")));

        let mut config = FuzzConfig::default();
        config.corpus.max_entries = Some(0);
        assert_eq!(config.validate(), Err(ConfigError::Zero("max-entries")));
    }

    #[test]
    fn load_from_file_reads_and_validates() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good.toml");
        fs::write(&good, "[session]\nseed = 7\n").unwrap();
        let config = FuzzConfig::load_from_file(&good).unwrap();
        assert_eq!(config.session.seed, Some(7));

        let bad = dir.path().join("bad.toml");
        fs::write(&bad, "[mutation]\ninsert-tag-p = -0.5\n").unwrap();
        let err = FuzzConfig::load_from_file(&bad).unwrap_err();
        assert!(err.to_string().contains("insert-tag-p"));

        let missing = dir.path().join("missing.toml");
        let err = FuzzConfig::load_from_file(&missing).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
