pub mod checker;

pub use checker::{CheckTarget, CheckType, CheckerError, HealthChecker, HealthResult};
