pub mod arch;
pub mod breakpoint;
pub mod catalog;
pub mod command;
pub mod config;
pub mod engine;
pub mod loader;
pub mod observer;
pub mod recorder;
pub mod registry;
pub mod stats;
pub mod symbolize;
pub mod tracer;
pub mod unwind;
mod util;

pub use nix::unistd::Pid;

pub use catalog::{CallbackRegistry, Operation};
pub use util::AsPid;
pub use command::Command;
pub use config::{Args, Config};
pub use engine::{Engine, Error};
pub use observer::Observer;
pub use tracer::Tracer;
