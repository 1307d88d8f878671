pub mod cli;
pub mod completion_client;
pub mod load_config;
pub mod watch;

pub use cli::{run, Cli, Commands};
