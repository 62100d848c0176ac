use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::HarnessError;

pub const DEFAULT_URL: &str = "http://127.0.0.1:0/opensovd";

// ── Launcher ────────────────────────────────────────────────────────────────

/// How the gateway gets started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launcher {
	/// A pre-built binary.
	Binary(PathBuf),
	/// `cargo run --bin <bin> --profile <profile> [--features ...] -- <args>`
	Cargo {
		bin: String,
		profile: String,
		features: Vec<String>,
	},
}

impl Default for Launcher {
	fn default() -> Self {
		Launcher::Cargo {
			bin: default_cargo_bin(),
			profile: default_profile(),
			features: Vec::new(),
		}
	}
}

impl Launcher {
	/// Program and full argument list for running the gateway with `args`.
	pub fn command_line(&self, args: &[String]) -> (String, Vec<String>) {
		match self {
			Launcher::Binary(path) => (path.to_string_lossy().into_owned(), args.to_vec()),
			Launcher::Cargo { bin, profile, features } => {
				let mut argv: Vec<String> = vec![
					"run".into(),
					"--bin".into(),
					bin.clone(),
					"--profile".into(),
					profile.clone(),
				];
				if !features.is_empty() {
					argv.push("--features".into());
					argv.push(features.join(","));
				}
				argv.push("--".into());
				argv.extend(args.iter().cloned());
				("cargo".to_string(), argv)
			}
		}
	}
}

// ── Harness config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HarnessConfig {
	pub launcher: Launcher,
	/// Arguments used when a caller starts the gateway without its own.
	pub default_args: Vec<String>,
	/// Working directory of the gateway.
	pub project_root: PathBuf,
	/// Appended to addresses read from `listening on: ...` lines.
	pub base_path: String,
	pub startup_timeout: Duration,
	pub shutdown_timeout: Duration,
	/// Upper bound on a single output read during startup.
	pub poll_interval: Duration,
	/// Mirror of the captured output, kept after the test ends.
	pub log_file: Option<PathBuf>,
}

impl Default for HarnessConfig {
	fn default() -> Self {
		Self {
			launcher: Launcher::default(),
			default_args: default_args(),
			project_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
			base_path: default_base_path(),
			startup_timeout: Duration::from_secs(default_startup_timeout()),
			shutdown_timeout: Duration::from_secs(default_shutdown_timeout()),
			poll_interval: Duration::from_millis(default_poll_interval()),
			log_file: None,
		}
	}
}

fn default_cargo_bin() -> String { "osovd-gateway".into() }
fn default_profile() -> String { "release".into() }
fn default_base_path() -> String { "/opensovd".into() }
fn default_startup_timeout() -> u64 { 15 }
fn default_shutdown_timeout() -> u64 { 5 }
fn default_poll_interval() -> u64 { 250 }
fn default_args() -> Vec<String> {
	vec!["--url".into(), DEFAULT_URL.into()]
}

// ── harness.toml format ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
	/// Path to a pre-built gateway; `cargo run` is used when absent.
	bin: Option<PathBuf>,
	#[serde(default = "default_cargo_bin")]
	cargo_bin: String,
	#[serde(default = "default_profile")]
	profile: String,
	#[serde(default)]
	features: Vec<String>,
	#[serde(default = "default_args")]
	args: Vec<String>,
	project_root: Option<PathBuf>,
	#[serde(default = "default_base_path")]
	base_path: String,
	#[serde(default = "default_startup_timeout")]
	startup_timeout_secs: u64,
	#[serde(default = "default_shutdown_timeout")]
	shutdown_timeout_secs: u64,
	#[serde(default = "default_poll_interval")]
	poll_interval_ms: u64,
	log_file: Option<PathBuf>,
}

impl ConfigFile {
	fn into_config(self, base_dir: Option<&Path>) -> HarnessConfig {
		let resolve = |p: PathBuf| match base_dir {
			Some(dir) if p.is_relative() => dir.join(p),
			_ => p,
		};
		let launcher = match self.bin {
			Some(path) => Launcher::Binary(resolve(path)),
			None => Launcher::Cargo {
				bin: self.cargo_bin,
				profile: self.profile,
				features: self.features,
			},
		};
		let defaults = HarnessConfig::default();
		HarnessConfig {
			launcher,
			default_args: self.args,
			project_root: self.project_root.map(resolve).unwrap_or(defaults.project_root),
			base_path: self.base_path,
			startup_timeout: Duration::from_secs(self.startup_timeout_secs),
			shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
			poll_interval: Duration::from_millis(self.poll_interval_ms),
			log_file: self.log_file.map(resolve),
		}
	}
}

impl HarnessConfig {
	pub fn from_toml_str(content: &str) -> Result<Self, HarnessError> {
		let file: ConfigFile =
			toml::from_str(content).map_err(|e| HarnessError::Config(e.to_string()))?;
		Ok(file.into_config(None))
	}

	/// Loads a `harness.toml`. Relative paths inside it are resolved against the
	/// file's directory.
	pub fn load(path: &Path) -> Result<Self, HarnessError> {
		let content = std::fs::read_to_string(path)
			.map_err(|e| HarnessError::Config(format!("failed to read {}: {}", path.display(), e)))?;
		let file: ConfigFile = toml::from_str(&content)
			.map_err(|e| HarnessError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
		Ok(file.into_config(path.parent()))
	}

	/// Defaults, then `SOVD_GATEWAY_CONFIG` if set, then the individual
	/// `SOVD_GATEWAY_*` overrides.
	pub fn from_env() -> Result<Self, HarnessError> {
		Self::from_vars(|key| std::env::var(key).ok())
	}

	pub fn from_vars<F>(var: F) -> Result<Self, HarnessError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let mut config = match var("SOVD_GATEWAY_CONFIG") {
			Some(path) => Self::load(Path::new(&path))?,
			None => Self::default(),
		};

		if let Some(bin) = var("SOVD_GATEWAY_BIN").filter(|s| !s.is_empty()) {
			config.launcher = Launcher::Binary(PathBuf::from(bin));
		}
		if let Launcher::Cargo { profile, features, .. } = &mut config.launcher {
			if let Some(p) = var("SOVD_GATEWAY_PROFILE").filter(|s| !s.is_empty()) {
				*profile = p;
			}
			if let Some(f) = var("SOVD_GATEWAY_FEATURES") {
				*features = split_list(&f, ',');
			}
		}
		if let Some(args) = var("SOVD_GATEWAY_ARGS") {
			let args = split_list(&args, ' ');
			if !args.is_empty() {
				config.default_args = args;
			}
		}
		if let Some(secs) = var("SOVD_GATEWAY_STARTUP_TIMEOUT") {
			let secs: f64 = secs.trim().parse().map_err(|_| {
				HarnessError::Config(format!("SOVD_GATEWAY_STARTUP_TIMEOUT: not a number: {}", secs))
			})?;
			config.startup_timeout = Duration::try_from_secs_f64(secs).map_err(|e| {
				HarnessError::Config(format!("SOVD_GATEWAY_STARTUP_TIMEOUT: {}", e))
			})?;
		}
		if let Some(path) = var("SOVD_GATEWAY_LOG_FILE").filter(|s| !s.is_empty()) {
			config.log_file = Some(PathBuf::from(path));
		}
		Ok(config)
	}
}

fn split_list(s: &str, sep: char) -> Vec<String> {
	s.split(sep)
		.map(str::trim)
		.filter(|p| !p.is_empty())
		.map(String::from)
		.collect()
}

/// Snapshot of this process's environment, for callers that want the gateway to
/// inherit it.
pub fn inherited_env() -> BTreeMap<String, String> {
	std::env::vars().collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let map: HashMap<String, String> =
			pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
		move |key: &str| map.get(key).cloned()
	}

	#[test]
	fn cargo_command_line() {
		let launcher = Launcher::Cargo {
			bin: "osovd-gateway".into(),
			profile: "dev".into(),
			features: vec!["jwt".into(), "proxy".into()],
		};
		let (program, argv) = launcher.command_line(&["--url".into(), DEFAULT_URL.into()]);
		assert_eq!(program, "cargo");
		assert_eq!(
			argv,
			vec![
				"run", "--bin", "osovd-gateway", "--profile", "dev", "--features", "jwt,proxy", "--",
				"--url", DEFAULT_URL,
			]
		);
	}

	#[test]
	fn binary_command_line() {
		let launcher = Launcher::Binary("/opt/gw".into());
		let (program, argv) = launcher.command_line(&["-v".into()]);
		assert_eq!(program, "/opt/gw");
		assert_eq!(argv, vec!["-v"]);
	}

	#[test]
	fn toml_defaults() {
		let config = HarnessConfig::from_toml_str("").unwrap();
		assert_eq!(config.launcher, Launcher::default());
		assert_eq!(config.default_args, vec!["--url", DEFAULT_URL]);
		assert_eq!(config.base_path, "/opensovd");
		assert_eq!(config.startup_timeout, Duration::from_secs(15));
		assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
		assert_eq!(config.poll_interval, Duration::from_millis(250));
	}

	#[test]
	fn toml_full() {
		let config = HarnessConfig::from_toml_str(
			r#"
			bin = "/usr/local/bin/osovd-gateway"
			args = ["--config", "gw.toml"]
			base_path = "/sovd"
			startup_timeout_secs = 30
			poll_interval_ms = 100
			"#,
		)
		.unwrap();
		assert_eq!(config.launcher, Launcher::Binary("/usr/local/bin/osovd-gateway".into()));
		assert_eq!(config.default_args, vec!["--config", "gw.toml"]);
		assert_eq!(config.base_path, "/sovd");
		assert_eq!(config.startup_timeout, Duration::from_secs(30));
		assert_eq!(config.poll_interval, Duration::from_millis(100));
	}

	#[test]
	fn toml_rejects_unknown_keys() {
		assert!(matches!(
			HarnessConfig::from_toml_str("startup_timeout = 3"),
			Err(HarnessError::Config(_))
		));
	}

	#[test]
	fn env_overrides() {
		let config = HarnessConfig::from_vars(vars(&[
			("SOVD_GATEWAY_PROFILE", "dev"),
			("SOVD_GATEWAY_FEATURES", "jwt, proxy"),
			("SOVD_GATEWAY_ARGS", "--url  http://127.0.0.1:0/sovd"),
			("SOVD_GATEWAY_STARTUP_TIMEOUT", "2.5"),
		]))
		.unwrap();
		assert_eq!(
			config.launcher,
			Launcher::Cargo {
				bin: "osovd-gateway".into(),
				profile: "dev".into(),
				features: vec!["jwt".into(), "proxy".into()],
			}
		);
		assert_eq!(config.default_args, vec!["--url", "http://127.0.0.1:0/sovd"]);
		assert_eq!(config.startup_timeout, Duration::from_millis(2500));
	}

	#[test]
	fn env_binary_wins_over_cargo() {
		let config = HarnessConfig::from_vars(vars(&[
			("SOVD_GATEWAY_BIN", "/tmp/gw"),
			("SOVD_GATEWAY_PROFILE", "dev"),
		]))
		.unwrap();
		assert_eq!(config.launcher, Launcher::Binary("/tmp/gw".into()));
	}

	#[test]
	fn env_bad_timeout() {
		let result = HarnessConfig::from_vars(vars(&[("SOVD_GATEWAY_STARTUP_TIMEOUT", "soon")]));
		assert!(matches!(result, Err(HarnessError::Config(_))));
	}

	#[test]
	fn blank_args_keep_default() {
		let config = HarnessConfig::from_vars(vars(&[("SOVD_GATEWAY_ARGS", "   ")])).unwrap();
		assert_eq!(config.default_args, vec!["--url", DEFAULT_URL]);
	}
}
