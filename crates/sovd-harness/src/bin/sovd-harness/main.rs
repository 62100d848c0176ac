use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use owo_colors::OwoColorize;
use sovd_harness::{inherited_env, GatewaySupervisor, HarnessConfig, Launcher, LineResult};

/// Start a SOVD gateway the way the integration tests do, print its base URL, and
/// keep it running until Ctrl-C.
#[derive(Debug, Parser)]
#[command(name = "sovd-harness", version)]
struct Cli {
	/// Pre-built gateway binary (default: cargo run)
	#[arg(long)]
	bin: Option<PathBuf>,
	/// Cargo profile used with cargo run
	#[arg(long)]
	profile: Option<String>,
	/// Comma-separated cargo features
	#[arg(long, value_delimiter = ',')]
	features: Vec<String>,
	/// harness.toml to load instead of SOVD_GATEWAY_* variables
	#[arg(long)]
	config: Option<PathBuf>,
	/// Seconds to wait for the readiness line
	#[arg(long)]
	startup_timeout: Option<f64>,
	/// Seconds between SIGTERM and SIGKILL
	#[arg(long)]
	shutdown_timeout: Option<f64>,
	/// Also write captured output here
	#[arg(long)]
	log_file: Option<PathBuf>,
	/// Arguments for the gateway itself
	#[arg(last = true)]
	args: Vec<String>,
}

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.with_writer(std::io::stderr)
		.init();

	let cli = Cli::parse();
	let config = match build_config(&cli) {
		Ok(c) => c,
		Err(e) => {
			eprintln!("{} {}", "error:".red(), e);
			std::process::exit(2);
		}
	};

	let args = if cli.args.is_empty() {
		config.default_args.clone()
	} else {
		cli.args.clone()
	};
	let startup_timeout = config.startup_timeout;
	let shutdown_timeout = config.shutdown_timeout;

	let mut sup = GatewaySupervisor::new(config);
	let url = match sup.start(&args, &inherited_env(), startup_timeout).await {
		Ok(url) => url,
		Err(e) => {
			eprintln!("{} {}", "error:".red(), e);
			std::process::exit(1);
		}
	};

	let mut drain = sup.output().drain();
	let forward = tokio::spawn(async move {
		loop {
			match drain.read_next_line(Duration::from_secs(1)).await {
				LineResult::Line(line) => eprintln!("{} {}", "|".dimmed(), line),
				LineResult::Timeout => continue,
				LineResult::EndOfStream => break,
			}
		}
	});

	println!("{}", url.green());
	eprintln!("{}", format!("pid {}, Ctrl-C to stop", sup.pid().unwrap_or_default()).dimmed());

	let mut check = tokio::time::interval(Duration::from_millis(500));
	let ctrl_c = tokio::signal::ctrl_c();
	tokio::pin!(ctrl_c);
	let exited = loop {
		tokio::select! {
			_ = &mut ctrl_c => break false,
			_ = check.tick() => {
				if !sup.is_running() {
					break true;
				}
			}
		}
	};

	if exited {
		eprintln!("{} gateway exited on its own", "error:".red());
	} else if let Err(e) = sup.stop(shutdown_timeout).await {
		eprintln!("{} {}", "error:".red(), e);
	}
	forward.abort();
	if exited {
		std::process::exit(1);
	}
}

fn build_config(cli: &Cli) -> Result<HarnessConfig, sovd_harness::HarnessError> {
	let mut config = match &cli.config {
		Some(path) => HarnessConfig::load(path)?,
		None => HarnessConfig::from_env()?,
	};

	if let Some(bin) = &cli.bin {
		config.launcher = Launcher::Binary(bin.clone());
	}
	if let Launcher::Cargo { profile, features, .. } = &mut config.launcher {
		if let Some(p) = &cli.profile {
			*profile = p.clone();
		}
		if !cli.features.is_empty() {
			*features = cli.features.clone();
		}
	}
	if let Some(secs) = cli.startup_timeout {
		config.startup_timeout = seconds(secs)?;
	}
	if let Some(secs) = cli.shutdown_timeout {
		config.shutdown_timeout = seconds(secs)?;
	}
	if let Some(path) = &cli.log_file {
		config.log_file = Some(path.clone());
	}
	Ok(config)
}

fn seconds(secs: f64) -> Result<Duration, sovd_harness::HarnessError> {
	Duration::try_from_secs_f64(secs)
		.map_err(|e| sovd_harness::HarnessError::Config(format!("invalid duration {}: {}", secs, e)))
}
