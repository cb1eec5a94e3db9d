use crate::errors::TapeError;
use crate::logging::{DEFAULT_DISK_BUDGET_BYTES, DEFAULT_MAX_PAYLOAD_BYTES};
use crate::runtime::FileSystem;
use crate::verify::Framing;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_FIXTURE_PATTERN: &str = "testdata/*.txt";

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub delay: Option<Duration>,
    pub dry_run: bool,
    pub strict_framing: bool,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub replay: ReplayConfig,
    pub verify: VerifyConfig,
    pub golden: GoldenConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayConfig {
    pub delay_ms: u64,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifyConfig {
    pub framing: Framing,
    pub shell: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GoldenConfig {
    pub patterns: Vec<String>,
    pub golden_extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub path: Option<PathBuf>,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

impl ReplayConfig {
    pub fn delay(&self) -> Option<Duration> {
        (self.delay_ms > 0).then(|| Duration::from_millis(self.delay_ms))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            replay: ReplayConfig {
                delay_ms: 0,
                dry_run: false,
            },
            verify: VerifyConfig {
                framing: Framing::Line,
                shell: "sh".to_string(),
            },
            golden: GoldenConfig {
                patterns: vec![DEFAULT_FIXTURE_PATTERN.to_string()],
                golden_extension: "golden".to_string(),
            },
            logging: LoggingConfig {
                path: None,
                max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
                budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialAppConfig {
    replay: Option<PartialReplayConfig>,
    verify: Option<PartialVerifyConfig>,
    golden: Option<PartialGoldenConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialReplayConfig {
    delay_ms: Option<u64>,
    dry_run: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialVerifyConfig {
    framing: Option<Framing>,
    shell: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialGoldenConfig {
    patterns: Option<Vec<String>>,
    golden_extension: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialLoggingConfig {
    path: Option<PathBuf>,
    max_payload_bytes: Option<usize>,
    budget_bytes: Option<u64>,
}

pub fn load_config(overrides: &CliOverrides, fs: &dyn FileSystem) -> Result<AppConfig, TapeError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let raw = fs.read(path)?;
        let text = String::from_utf8(raw)
            .map_err(|e| TapeError::ConfigParse(format!("{}: {e}", path.display())))?;
        let partial: PartialAppConfig =
            toml::from_str(&text).map_err(|e| TapeError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(replay) = partial.replay {
        if let Some(value) = replay.delay_ms {
            cfg.replay.delay_ms = value;
        }
        if let Some(value) = replay.dry_run {
            cfg.replay.dry_run = value;
        }
    }

    if let Some(verify) = partial.verify {
        if let Some(value) = verify.framing {
            cfg.verify.framing = value;
        }
        if let Some(value) = verify.shell {
            cfg.verify.shell = value;
        }
    }

    if let Some(golden) = partial.golden {
        if let Some(value) = golden.patterns {
            cfg.golden.patterns = value;
        }
        if let Some(value) = golden.golden_extension {
            cfg.golden.golden_extension = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(value) = logging.path {
            cfg.logging.path = Some(value);
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(path) = &overrides.log_file {
        cfg.logging.path = Some(path.clone());
    }
    if let Some(delay) = overrides.delay {
        cfg.replay.delay_ms = delay.as_millis() as u64;
    }
    if overrides.dry_run {
        cfg.replay.dry_run = true;
    }
    if overrides.strict_framing {
        cfg.verify.framing = Framing::ByteCount;
    }
    if !overrides.patterns.is_empty() {
        cfg.golden.patterns = overrides.patterns.clone();
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), TapeError> {
    if cfg.verify.shell.trim().is_empty() {
        return Err(TapeError::InvalidConfig(
            "verify.shell must not be empty".to_string(),
        ));
    }
    if cfg.golden.patterns.iter().all(|p| p.trim().is_empty()) {
        return Err(TapeError::InvalidConfig(
            "golden.patterns must contain at least one pattern".to_string(),
        ));
    }
    let ext = cfg.golden.golden_extension.trim();
    if ext.is_empty() || ext.starts_with('.') {
        return Err(TapeError::InvalidConfig(
            "golden.golden_extension must be a bare extension like \"golden\"".to_string(),
        ));
    }
    if cfg.logging.max_payload_bytes == 0 {
        return Err(TapeError::InvalidConfig(
            "logging.max_payload_bytes must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{load_config, AppConfig, CliOverrides};
    use crate::errors::TapeError;
    use crate::runtime::FakeFileSystem;
    use crate::verify::Framing;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn defaults_apply_without_config_file() {
        let cfg = load_config(&CliOverrides::default(), &FakeFileSystem::default())
            .expect("defaults");
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.golden.patterns, vec!["testdata/*.txt".to_string()]);
        assert_eq!(cfg.replay.delay(), None);
    }

    #[test]
    fn file_values_merge_over_defaults_and_cli_wins() {
        let fs = FakeFileSystem::default().with_file(
            "tapedeck.toml",
            "[replay]\ndelay_ms = 500\n\n[verify]\nframing = \"byte_count\"\n\n[golden]\npatterns = [\"fixtures/*.rec\"]\n",
        );
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("tapedeck.toml")),
            delay: Some(Duration::from_millis(20)),
            ..CliOverrides::default()
        };
        let cfg = load_config(&overrides, &fs).expect("config");
        assert_eq!(cfg.replay.delay(), Some(Duration::from_millis(20)));
        assert_eq!(cfg.verify.framing, Framing::ByteCount);
        assert_eq!(cfg.verify.shell, "sh");
        assert_eq!(cfg.golden.patterns, vec!["fixtures/*.rec".to_string()]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let fs = FakeFileSystem::default().with_file("bad.toml", "[replay]\nspeed = 2\n");
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("bad.toml")),
            ..CliOverrides::default()
        };
        let err = load_config(&overrides, &fs).expect_err("unknown key");
        assert!(matches!(err, TapeError::ConfigParse(_)));
    }

    #[test]
    fn invalid_golden_extension_is_rejected() {
        let fs = FakeFileSystem::default()
            .with_file("cfg.toml", "[golden]\ngolden_extension = \".golden\"\n");
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("cfg.toml")),
            ..CliOverrides::default()
        };
        let err = load_config(&overrides, &fs).expect_err("leading dot");
        assert!(matches!(err, TapeError::InvalidConfig(_)));
    }

    #[test]
    fn strict_framing_flag_selects_byte_count() {
        let overrides = CliOverrides {
            strict_framing: true,
            ..CliOverrides::default()
        };
        let cfg = load_config(&overrides, &FakeFileSystem::default()).expect("config");
        assert_eq!(cfg.verify.framing, Framing::ByteCount);
    }
}
