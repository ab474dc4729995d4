pub mod app;
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod native;
pub mod registry;
pub mod render_queue;
pub mod session;
pub mod sync_bridge;
pub mod texture;
pub mod token;
pub mod vfs;
pub mod view_state;

pub use app::{run, run_with_config, run_with_overrides, RunSummary};
pub use bootstrap::{create_runtime, EngineHandle, EngineModule, RuntimeOptions};
pub use session::{EngineSession, SessionOptions};
