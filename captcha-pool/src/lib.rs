//! captcha-pool: capacity-adaptive pool of pre-generated captcha challenges.

mod pool;
mod state;

pub mod bridge;
pub mod config;
pub mod generator;
pub mod launcher;
pub mod logging;
pub mod worker;

pub use config::{ConfigError, PoolConfig};
pub use generator::{GenerateError, Generator};
pub use launcher::{InProcessLauncher, LaunchError, Launcher, ProcessLauncher};
pub use pool::{CaptchaPool, PoolError};
pub use state::{CAPACITY_FLOOR, DEMAND_THRESHOLD, PoolStats};
pub use worker::run_worker;
