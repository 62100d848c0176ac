use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::output::{deadline_after, OutputCapture, OutputDrain};
use crate::process::ProcessHandle;
use crate::readiness::{ReadinessMatcher, ReadinessScan};
use crate::types::*;

/// How long to keep collecting output after the process died during startup, so the
/// failure carries its last words. Bounded because grandchildren may hold the pipe.
const EXIT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// What was last launched: kept for diagnostics and for asserting on in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
	pub program: String,
	pub argv: Vec<String>,
	pub env: BTreeMap<String, String>,
}

/// Handed to the body of [`GatewaySupervisor::run_scoped`].
#[derive(Clone)]
pub struct RunningGateway {
	pub base_url: String,
	pub pid: u32,
	pub output: OutputCapture,
}

/// Owns one gateway process from spawn to reap.
///
/// Lifecycle calls take `&mut self`, so a single owner drives the state machine.
/// Dropping the supervisor while the process is alive kills its process group.
pub struct GatewaySupervisor {
	config: HarnessConfig,
	matcher: ReadinessMatcher,
	state: SupervisorState,
	process: Option<ProcessHandle>,
	output: OutputCapture,
	base_url: Option<String>,
	launch: Option<LaunchSpec>,
}

enum StartupFailure {
	/// Exit code, plus the base URL if the readiness line turned up in the output
	/// collected after death.
	Exited(Option<i32>, Option<String>),
	TimedOut,
}

impl GatewaySupervisor {
	pub fn new(config: HarnessConfig) -> Self {
		let matcher = ReadinessMatcher::new(config.base_path.clone());
		Self {
			config,
			matcher,
			state: SupervisorState::NotStarted,
			process: None,
			output: OutputCapture::new(None),
			base_url: None,
			launch: None,
		}
	}

	pub fn config(&self) -> &HarnessConfig {
		&self.config
	}

	pub fn state(&self) -> SupervisorState {
		self.state
	}

	pub fn base_url(&self) -> Option<&str> {
		self.base_url.as_deref()
	}

	pub fn pid(&self) -> Option<u32> {
		if !self.state.has_process() {
			return None;
		}
		self.process.as_ref().map(|p| p.pid())
	}

	pub fn launch_spec(&self) -> Option<&LaunchSpec> {
		self.launch.as_ref()
	}

	pub fn output(&self) -> &OutputCapture {
		&self.output
	}

	/// Everything captured from the current or last process.
	pub fn log(&self) -> crate::error::CapturedLog {
		self.output.snapshot()
	}

	/// Whether the gateway process is alive. Notices an unsolicited exit of a running
	/// gateway and moves the supervisor to `Failed`.
	pub fn is_running(&mut self) -> bool {
		if !self.state.has_process() {
			return false;
		}
		let alive = self.process.as_mut().is_some_and(|p| p.is_alive());
		if !alive && self.state == SupervisorState::Running {
			let code = self.process.as_ref().and_then(|p| p.exit_code());
			tracing::warn!("gateway exited unexpectedly (exit {:?})", code);
			self.state = SupervisorState::Failed;
			self.base_url = None;
			self.process = None;
		}
		alive
	}

	/// Spawns the gateway and waits until it logs where it is listening.
	///
	/// The child's environment is exactly `env`; see [`crate::inherited_env`].
	///
	/// A process that prints its readiness line and exits straight away may end either
	/// way: `Ok` if the line is read before the exit is noticed, otherwise
	/// `ProcessExited` with `announced` set to the URL it printed.
	pub async fn start(
		&mut self,
		args: &[String],
		env: &BTreeMap<String, String>,
		startup_timeout: Duration,
	) -> Result<String, HarnessError> {
		if self.state != SupervisorState::NotStarted {
			return Err(HarnessError::InvalidState {
				operation: "start",
				state: self.state,
			});
		}

		let (program, argv) = self.config.launcher.command_line(args);
		self.output = OutputCapture::new(self.config.log_file.as_deref());
		self.launch = Some(LaunchSpec {
			program: program.clone(),
			argv: argv.clone(),
			env: env.clone(),
		});

		let process = match ProcessHandle::spawn(
			&program,
			&argv,
			env,
			&self.config.project_root,
			&self.output,
		) {
			Ok(p) => p,
			Err(e) => {
				tracing::error!("{}", e);
				self.state = SupervisorState::Failed;
				return Err(e);
			}
		};
		tracing::info!("gateway starting: {} {} (pid {})", program, argv.join(" "), process.pid());
		let process = self.process.insert(process);
		self.state = SupervisorState::Starting;

		let mut drain = self.output.drain();
		let result = await_ready(
			process,
			&mut drain,
			&self.matcher,
			self.config.poll_interval,
			startup_timeout,
		)
		.await;

		match result {
			Ok(readiness) => {
				let url = readiness.base_url();
				tracing::info!("gateway ready at {}", url);
				self.base_url = Some(url.clone());
				self.state = SupervisorState::Running;
				Ok(url)
			}
			Err(StartupFailure::Exited(exit, announced)) => {
				self.state = SupervisorState::Failed;
				self.process = None;
				Err(HarnessError::ProcessExited {
					exit,
					announced,
					log: self.output.snapshot(),
				})
			}
			Err(StartupFailure::TimedOut) => {
				tracing::warn!("gateway not ready after {:?}, killing it", startup_timeout);
				if let Some(mut process) = self.process.take() {
					let _ = process.send_signal(SignalKind::Kill);
					let _ = process.wait_for_exit(None).await;
				}
				self.state = SupervisorState::Failed;
				Err(HarnessError::StartupTimeout {
					timeout: startup_timeout,
					log: self.output.snapshot(),
				})
			}
		}
	}

	/// Starts with the configured default arguments and timeout, inheriting this
	/// process's environment.
	pub async fn start_default(&mut self) -> Result<String, HarnessError> {
		let args = self.config.default_args.clone();
		let timeout = self.config.startup_timeout;
		self.start(&args, &crate::config::inherited_env(), timeout).await
	}

	/// Terminates the gateway, escalating to a kill after `shutdown_timeout`.
	///
	/// A no-op unless the gateway is starting or running. The kill phase waits
	/// without bound.
	pub async fn stop(&mut self, shutdown_timeout: Duration) -> Result<(), HarnessError> {
		if !matches!(self.state, SupervisorState::Starting | SupervisorState::Running) {
			return Ok(());
		}
		self.state = SupervisorState::Stopping;
		self.base_url = None;

		let result = match self.process.as_mut() {
			Some(process) => terminate(process, shutdown_timeout).await,
			None => Ok(None),
		};

		self.process = None;
		self.state = SupervisorState::Stopped;
		match result {
			Ok(Some(code)) => {
				tracing::info!("gateway stopped (exit {})", code);
				Ok(())
			}
			Ok(None) => Ok(()),
			Err(e) => Err(e),
		}
	}

	pub fn send_signal(&mut self, kind: SignalKind) -> Result<(), HarnessError> {
		if !self.is_running() {
			return Err(HarnessError::NotRunning);
		}
		match self.process.as_mut() {
			Some(process) => process.send_signal(kind),
			None => Err(HarnessError::NotRunning),
		}
	}

	/// Starts the gateway, runs `body`, and stops the gateway again.
	///
	/// If `body` panics the supervisor is dropped during unwinding, which kills the
	/// process group.
	pub async fn run_scoped<F, Fut, T>(
		mut self,
		args: &[String],
		env: &BTreeMap<String, String>,
		body: F,
	) -> Result<T, HarnessError>
	where
		F: FnOnce(RunningGateway) -> Fut,
		Fut: Future<Output = T>,
	{
		let startup_timeout = self.config.startup_timeout;
		let base_url = self.start(args, env, startup_timeout).await?;
		let gateway = RunningGateway {
			base_url,
			pid: self.pid().unwrap_or_default(),
			output: self.output.clone(),
		};

		let value = body(gateway).await;

		let shutdown_timeout = self.config.shutdown_timeout;
		self.stop(shutdown_timeout).await?;
		Ok(value)
	}
}

async fn await_ready(
	process: &mut ProcessHandle,
	drain: &mut OutputDrain,
	matcher: &ReadinessMatcher,
	poll_interval: Duration,
	startup_timeout: Duration,
) -> Result<Readiness, StartupFailure> {
	let deadline = deadline_after(startup_timeout);
	let mut scan = ReadinessScan::new(matcher);

	loop {
		if !process.is_alive() {
			let announced = collect_remaining(drain, &mut scan).await.map(|r| r.base_url());
			tracing::warn!("gateway exited during startup (exit {:?})", process.exit_code());
			return Err(StartupFailure::Exited(process.exit_code(), announced));
		}

		let now = Instant::now();
		if now >= deadline {
			return Err(StartupFailure::TimedOut);
		}
		let wait = poll_interval.min(deadline - now);

		match drain.read_next_line(wait).await {
			LineResult::Line(line) => {
				if let Some(readiness) = scan.feed(&line) {
					return Ok(readiness);
				}
			}
			LineResult::Timeout => {}
			// Output closed; the process is on its way out. Wait for it instead of
			// spinning on an empty stream.
			LineResult::EndOfStream => {
				let _ = process.wait_for_exit(Some(wait)).await;
			}
		}
	}
}

/// Waits for the pipes of a dead process to close so its last lines are captured.
/// Those lines still go through `scan`; the first readiness found is returned.
async fn collect_remaining(
	drain: &mut OutputDrain,
	scan: &mut ReadinessScan<'_>,
) -> Option<Readiness> {
	let deadline = Instant::now() + EXIT_DRAIN_GRACE;
	let mut announced = None;
	loop {
		let now = Instant::now();
		if now >= deadline {
			return announced;
		}
		match drain.read_next_line(deadline - now).await {
			LineResult::Line(line) => {
				let found = scan.feed(&line);
				if announced.is_none() {
					announced = found;
				}
			}
			LineResult::Timeout | LineResult::EndOfStream => return announced,
		}
	}
}

/// Returns the exit code, or `None` if the process was already gone.
async fn terminate(
	process: &mut ProcessHandle,
	shutdown_timeout: Duration,
) -> Result<Option<i32>, HarnessError> {
	match process.send_signal(SignalKind::Terminate) {
		Ok(()) => {}
		Err(HarnessError::NotRunning) => return Ok(process.exit_code()),
		Err(e) => tracing::warn!("failed to send SIGTERM to pid {}: {}", process.pid(), e),
	}

	if let ExitResult::Exited(code) = process.wait_for_exit(Some(shutdown_timeout)).await? {
		return Ok(Some(code));
	}

	tracing::warn!(
		"pid {} ignored SIGTERM for {:?}, sending SIGKILL",
		process.pid(),
		shutdown_timeout
	);
	match process.send_signal(SignalKind::Kill) {
		Ok(()) | Err(HarnessError::NotRunning) => {}
		Err(e) => return Err(e),
	}
	match process.wait_for_exit(None).await? {
		ExitResult::Exited(code) => Ok(Some(code)),
		ExitResult::TimedOut => Ok(None),
	}
}
