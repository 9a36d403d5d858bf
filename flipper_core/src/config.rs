use crate::executor::CommandExecutorConfig;
use crate::fuzzer::{FuzzOptions, InputDelivery, TargetSpec, default_iterations};
use crate::input::InputBuffer;
use crate::mutator::MutationMode;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SEED_LEN: usize = 100;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigInputDelivery {
    #[default]
    Argument,
    Stdin,
    File {
        template: String,
    },
}

impl From<ConfigInputDelivery> for InputDelivery {
    fn from(delivery: ConfigInputDelivery) -> Self {
        match delivery {
            ConfigInputDelivery::Argument => InputDelivery::Argument,
            ConfigInputDelivery::Stdin => InputDelivery::Stdin,
            ConfigInputDelivery::File { template } => InputDelivery::File { template },
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub input_delivery: ConfigInputDelivery,
    /// Zero disables the deadline.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    pub working_dir: Option<PathBuf>,
    pub env: Option<BTreeMap<String, String>>,
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_kill_grace_ms() -> u64 {
    100
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            input_delivery: ConfigInputDelivery::default(),
            timeout_ms: default_timeout_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            working_dir: None,
            env: None,
        }
    }
}

impl TargetSettings {
    pub fn executor_config(&self) -> CommandExecutorConfig {
        CommandExecutorConfig {
            timeout: (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms)),
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            working_dir: self.working_dir.clone(),
        }
    }

    pub fn target_spec(&self) -> TargetSpec {
        TargetSpec {
            command: self.command.clone(),
            delivery: self.input_delivery.clone().into(),
            env: self.env.clone(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_iterations")]
    pub iterations: u64,
    #[serde(default)]
    pub mutation_mode: MutationMode,
    pub rng_seed: Option<u64>,
    pub seed_text: Option<String>,
    /// Raw seed bytes; takes precedence over `seed_text`.
    pub seed_file: Option<PathBuf>,
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            mutation_mode: MutationMode::default(),
            rng_seed: None,
            seed_text: None,
            seed_file: None,
        }
    }
}

impl FuzzerSettings {
    pub fn fuzz_options(&self) -> FuzzOptions {
        FuzzOptions {
            iterations: self.iterations,
            mutation_mode: self.mutation_mode,
            rng_seed: self.rng_seed,
        }
    }

    /// The starting buffer: the seed file, else the seed text, else 100 x `A`.
    pub fn load_seed(&self) -> Result<InputBuffer, anyhow::Error> {
        if let Some(path) = &self.seed_file {
            let bytes = std::fs::read(path)
                .map_err(|e| anyhow::anyhow!("Failed to read seed file {:?}: {}", path, e))?;
            return Ok(InputBuffer::from(bytes));
        }
        Ok(match &self.seed_text {
            Some(text) => InputBuffer::from(text.as_str()),
            None => InputBuffer::from(vec![b'A'; DEFAULT_SEED_LEN]),
        })
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FlipperConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub target: TargetSettings,
}

impl FlipperConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        Self::from_toml(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let config = FlipperConfig::from_toml("").unwrap();
        assert_eq!(config, FlipperConfig::default());
        assert_eq!(config.fuzzer.iterations, 100);
        assert_eq!(config.fuzzer.mutation_mode, MutationMode::Cumulative);
        assert_eq!(config.target.input_delivery, ConfigInputDelivery::Argument);
        assert_eq!(
            config.target.executor_config().timeout,
            Some(Duration::from_millis(2000))
        );
    }

    #[test]
    fn full_document_parses() {
        let config = FlipperConfig::from_toml(
            r#"
            [fuzzer]
            iterations = 500
            mutation-mode = "seed-relative"
            rng-seed = 7
            seed-text = "hello"

            [target]
            command = ["/usr/local/bin/target", "--parse"]
            input-delivery = { file = { template = "--input={}" } }
            timeout-ms = 0
            kill-grace-ms = 50
            working-dir = "/tmp"
            env = { ASAN_OPTIONS = "detect_leaks=0" }
            "#,
        )
        .unwrap();

        let options = config.fuzzer.fuzz_options();
        assert_eq!(options.iterations, 500);
        assert_eq!(options.mutation_mode, MutationMode::SeedRelative);
        assert_eq!(options.rng_seed, Some(7));
        assert_eq!(config.fuzzer.load_seed().unwrap().as_bytes(), b"hello");

        let spec = config.target.target_spec();
        assert_eq!(spec.command, vec!["/usr/local/bin/target", "--parse"]);
        assert_eq!(
            spec.delivery,
            InputDelivery::File {
                template: "--input={}".into()
            }
        );
        assert_eq!(
            spec.env.unwrap().get("ASAN_OPTIONS").map(String::as_str),
            Some("detect_leaks=0")
        );

        let executor = config.target.executor_config();
        assert_eq!(executor.timeout, None);
        assert_eq!(executor.kill_grace, Duration::from_millis(50));
        assert_eq!(executor.working_dir, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn stdin_delivery_parses() {
        let config = FlipperConfig::from_toml("[target]\ninput-delivery = \"stdin\"\n").unwrap();
        assert_eq!(config.target.target_spec().delivery, InputDelivery::Stdin);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(FlipperConfig::from_toml("[fuzzer]\nthreads = 4\n").is_err());
    }

    #[test]
    fn default_seed_is_hundred_a() {
        let seed = FuzzerSettings::default().load_seed().unwrap();
        assert_eq!(seed.as_bytes(), vec![b'A'; 100].as_slice());
    }

    #[test]
    fn seed_file_wins_over_text() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0, 1, 2, 0xff]).unwrap();
        let settings = FuzzerSettings {
            seed_text: Some("ignored".into()),
            seed_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(settings.load_seed().unwrap().as_bytes(), &[0, 1, 2, 0xff]);
    }

    #[test]
    fn missing_seed_file_is_an_error() {
        let settings = FuzzerSettings {
            seed_file: Some(PathBuf::from("/definitely/not/here.bin")),
            ..Default::default()
        };
        let err = settings.load_seed().unwrap_err();
        assert!(err.to_string().contains("Failed to read seed file"));
    }

    #[test]
    fn load_from_file_reports_parse_errors_with_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[fuzzer]\niterations = \"many\"").unwrap();
        let err = FlipperConfig::load_from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse TOML"));

        let mut good = tempfile::NamedTempFile::new().unwrap();
        writeln!(good, "[target]\ncommand = [\"/bin/true\"]").unwrap();
        let config = FlipperConfig::load_from_file(good.path()).unwrap();
        assert_eq!(config.target.command, vec!["/bin/true"]);
    }
}
