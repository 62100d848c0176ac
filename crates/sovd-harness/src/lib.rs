//! # sovd-harness
//!
//! Runs a SOVD gateway for the duration of an integration test.
//!
//! Spawns the gateway, captures its output, waits for the line that says where it is
//! listening, and hands back the base URL. Stopping sends SIGTERM and escalates to
//! SIGKILL; dropping the supervisor kills whatever is still running.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use sovd_harness::{GatewaySupervisor, HarnessConfig, inherited_env};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = HarnessConfig::from_env().unwrap();
//! let args = config.default_args.clone();
//!
//! let status = GatewaySupervisor::new(config)
//!     .run_scoped(&args, &inherited_env(), |gw| async move {
//!         println!("gateway at {}", gw.base_url);
//!         200
//!     })
//!     .await
//!     .unwrap();
//! assert_eq!(status, 200);
//! # }
//! ```

pub mod types;
pub mod error;
pub mod config;
pub mod readiness;
pub mod output;
pub mod process;
pub mod supervisor;

pub use types::*;
pub use error::{CapturedLog, HarnessError};
pub use config::{inherited_env, HarnessConfig, Launcher};
pub use readiness::{ReadinessMatcher, ReadinessScan};
pub use output::{OutputCapture, OutputDrain};
pub use process::ProcessHandle;
pub use supervisor::{GatewaySupervisor, LaunchSpec, RunningGateway};
