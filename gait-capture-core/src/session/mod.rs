pub mod barrier;
pub mod orchestrator;
