use std::fmt;

/// Lifecycle of a supervised gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
	NotStarted,
	Starting,
	Running,
	Stopping,
	Stopped,
	Failed,
}

impl SupervisorState {
	/// States in which an OS process exists and a pid is known.
	pub fn has_process(&self) -> bool {
		matches!(
			self,
			SupervisorState::Starting | SupervisorState::Running | SupervisorState::Stopping
		)
	}
}

impl fmt::Display for SupervisorState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			SupervisorState::NotStarted => "not started",
			SupervisorState::Starting => "starting",
			SupervisorState::Running => "running",
			SupervisorState::Stopping => "stopping",
			SupervisorState::Stopped => "stopped",
			SupervisorState::Failed => "failed",
		};
		f.write_str(s)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
	/// Cooperative shutdown (SIGTERM).
	Terminate,
	/// Unconditional termination (SIGKILL).
	Kill,
	Interrupt,
	Hangup,
}

impl SignalKind {
	pub fn as_nix(&self) -> nix::sys::signal::Signal {
		use nix::sys::signal::Signal;
		match self {
			SignalKind::Terminate => Signal::SIGTERM,
			SignalKind::Kill => Signal::SIGKILL,
			SignalKind::Interrupt => Signal::SIGINT,
			SignalKind::Hangup => Signal::SIGHUP,
		}
	}
}

/// Outcome of a bounded read from the output drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineResult {
	Line(String),
	/// Nothing arrived within the bound. Not an error.
	Timeout,
	/// Every writer closed its end of the pipe.
	EndOfStream,
}

/// Outcome of a bounded wait on the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitResult {
	Exited(i32),
	TimedOut,
}

/// What the readiness matcher pulls out of a log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
	pub protocol: String,
	pub address: String,
	pub base_path: String,
}

impl Readiness {
	pub fn base_url(&self) -> String {
		format!("{}://{}{}", self.protocol, self.address, self.base_path)
	}
}
