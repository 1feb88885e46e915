use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Submit one still image and wait for the reply
    Image,
    /// Stream frames continuously
    Video,
}

/// Object detection client talking to a remote service over MQTT
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Operating mode
    #[arg(long, value_enum)]
    pub mode: Mode,

    /// Image file in `image` mode; in `video` mode a directory of frames,
    /// a video file or a camera index such as `0`
    #[arg(long, value_name = "SOURCE")]
    pub source: String,

    /// Directory receiving annotated frames (overrides configuration)
    #[arg(long, value_name = "DIR")]
    pub output: Option<PathBuf>,
}
