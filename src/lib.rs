pub mod artifacts;
pub mod checkpoint;
pub mod commit;
pub mod config;
pub mod errors;
pub mod llm;
pub mod logging;
pub mod orchestrator;
pub mod plugins;
pub mod prompts;
pub mod session;
pub mod tasks;
pub mod util;
pub mod vision;

#[cfg(test)]
mod testing;
