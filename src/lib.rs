pub mod cli;
pub mod config;
pub mod connectivity;
pub mod orchestrator;
pub mod queue;
pub mod remote;
pub mod replayer;
pub mod report;
pub mod util;
