pub mod app;
pub mod cli;
pub mod config;
pub mod correlator;
pub mod detection;
pub mod dispatcher;
pub mod identity;
pub mod presentation;
pub mod render;
pub mod slot;
pub mod source;
pub mod transport;

pub use app::start_app;
