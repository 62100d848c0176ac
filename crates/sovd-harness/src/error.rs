use std::fmt;
use std::io;
use std::time::Duration;

use crate::types::SupervisorState;

/// Everything the gateway printed up to the point of failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedLog(pub Vec<String>);

impl CapturedLog {
	pub fn lines(&self) -> &[String] {
		&self.0
	}

	pub fn contains(&self, needle: &str) -> bool {
		self.0.iter().any(|line| line.contains(needle))
	}
}

impl fmt::Display for CapturedLog {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.0.is_empty() {
			return f.write_str("<no output>");
		}
		for line in &self.0 {
			writeln!(f, "  | {}", line)?;
		}
		Ok(())
	}
}

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
	#[error("failed to spawn {program}: {source}")]
	Spawn {
		program: String,
		#[source]
		source: io::Error,
	},

	#[error("gateway exited before becoming ready ({}). Logs:\n{log}", describe_exit(.exit, .announced))]
	ProcessExited {
		exit: Option<i32>,
		/// Base URL from a readiness line the process printed before dying.
		announced: Option<String>,
		log: CapturedLog,
	},

	#[error("gateway failed to start within {timeout:?}. Logs:\n{log}")]
	StartupTimeout { timeout: Duration, log: CapturedLog },

	#[error("gateway is not running")]
	NotRunning,

	#[error("cannot {operation} while {state}")]
	InvalidState {
		operation: &'static str,
		state: SupervisorState,
	},

	#[error("failed to deliver signal: {0}")]
	Signal(#[from] nix::Error),

	#[error("io error: {0}")]
	Io(#[from] io::Error),

	#[error("config error: {0}")]
	Config(String),
}

impl HarnessError {
	/// The captured output, for the failures that carry one.
	pub fn captured_log(&self) -> Option<&CapturedLog> {
		match self {
			HarnessError::ProcessExited { log, .. } | HarnessError::StartupTimeout { log, .. } => {
				Some(log)
			}
			_ => None,
		}
	}
}

fn describe_exit(exit: &Option<i32>, announced: &Option<String>) -> String {
	let status = match exit {
		Some(code) => format!("exit {}", code),
		None => "exit status unknown".to_string(),
	};
	match announced {
		Some(url) => format!("{} after announcing {}", status, url),
		None => status,
	}
}
