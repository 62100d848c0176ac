use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::error::HarnessError;
use crate::output::OutputCapture;
use crate::types::{ExitResult, SignalKind};

/// A spawned process, leader of its own process group.
///
/// Signals go to the whole group so that a server started through a wrapper such as
/// `cargo run` sees them too. Dropping a handle whose process has not been observed to
/// exit kills the group.
pub struct ProcessHandle {
	child: Child,
	pid: u32,
	exit_code: Option<i32>,
}

impl ProcessHandle {
	/// Spawns `program` with exactly `env` as its environment. stdin is closed; stdout
	/// and stderr are both fed into `output`.
	pub fn spawn(
		program: &str,
		args: &[String],
		env: &BTreeMap<String, String>,
		dir: &Path,
		output: &OutputCapture,
	) -> Result<Self, HarnessError> {
		let mut cmd = Command::new(program);
		cmd.args(args)
			.current_dir(dir)
			.env_clear()
			.envs(env)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.process_group(0)
			.kill_on_drop(true);

		let mut child = cmd.spawn().map_err(|source| HarnessError::Spawn {
			program: program.to_string(),
			source,
		})?;

		let pid = child.id().ok_or_else(|| HarnessError::Spawn {
			program: program.to_string(),
			source: std::io::Error::other("process exited before its pid could be read"),
		})?;

		if let Some(stdout) = child.stdout.take() {
			output.attach(stdout);
		}
		if let Some(stderr) = child.stderr.take() {
			output.attach(stderr);
		}

		tracing::debug!("spawned {} (pid {})", program, pid);
		Ok(Self {
			child,
			pid,
			exit_code: None,
		})
	}

	pub fn pid(&self) -> u32 {
		self.pid
	}

	/// The exit code, once the process has been observed to exit.
	pub fn exit_code(&self) -> Option<i32> {
		self.exit_code
	}

	pub fn is_alive(&mut self) -> bool {
		if self.exit_code.is_some() {
			return false;
		}
		match self.child.try_wait() {
			Ok(Some(status)) => {
				self.record_exit(status);
				false
			}
			Ok(None) => true,
			Err(e) => {
				tracing::warn!("could not query pid {}: {}", self.pid, e);
				self.exit_code = Some(-1);
				false
			}
		}
	}

	pub fn send_signal(&mut self, kind: SignalKind) -> Result<(), HarnessError> {
		if !self.is_alive() {
			return Err(HarnessError::NotRunning);
		}
		let result = killpg(self.pgid(), kind.as_nix());
		if kind == SignalKind::Kill {
			// The leader must die even if the group signal raced with its exit.
			let _ = self.child.start_kill();
		}
		match result {
			Ok(()) => Ok(()),
			// Group already empty: the leader exited between the liveness check and now.
			Err(nix::errno::Errno::ESRCH) => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	/// Waits for the process to exit. `None` waits without bound.
	///
	/// Returns the recorded code immediately if the exit was already observed.
	pub async fn wait_for_exit(
		&mut self,
		timeout: Option<Duration>,
	) -> Result<ExitResult, HarnessError> {
		if let Some(code) = self.exit_code {
			return Ok(ExitResult::Exited(code));
		}
		let status = match timeout {
			Some(t) => match tokio::time::timeout(t, self.child.wait()).await {
				Ok(status) => status?,
				Err(_) => return Ok(ExitResult::TimedOut),
			},
			None => self.child.wait().await?,
		};
		Ok(ExitResult::Exited(self.record_exit(status)))
	}

	fn record_exit(&mut self, status: ExitStatus) -> i32 {
		// Shell convention for signal deaths.
		let code = status
			.code()
			.or_else(|| status.signal().map(|s| 128 + s))
			.unwrap_or(-1);
		tracing::debug!("pid {} exited ({})", self.pid, code);
		self.exit_code = Some(code);
		code
	}

	fn pgid(&self) -> Pid {
		Pid::from_raw(self.pid as i32)
	}
}

impl Drop for ProcessHandle {
	fn drop(&mut self) {
		if self.is_alive() {
			tracing::warn!("pid {} still running on drop, killing its process group", self.pid);
			let _ = killpg(self.pgid(), Signal::SIGKILL);
		}
	}
}
