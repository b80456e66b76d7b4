// Library interface for pipevisor
// The binary, integration tests and benchmarks all go through these modules

pub mod daemon;
pub mod error;
pub mod logging;
pub mod signal;
pub mod stages;
