// Use log::* macros instead of println!/eprintln! for proper log level control
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod aggregator;
pub mod classifier;
pub mod config;
pub mod content_index;
pub mod digest;
pub mod intake;
pub mod ipc;
pub mod scanner;
pub mod supervisor;
pub mod watcher;
