pub mod announcer;
pub mod app;
pub mod capture;
pub mod channel;
pub mod config;
pub mod detection;
pub mod encoder;
pub mod protocol;
pub mod render;
pub mod slot;
mod ui;

pub use app::{run, Session, SessionConfig, TickReport};
pub use config::{Cli, SpeechEngine};
