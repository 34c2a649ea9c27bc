pub mod gameserversets;
pub mod util;

#[cfg(feature = "metrics")]
pub mod metrics;
