//! Default collaborator implementations backed by the ffmpeg/ffprobe binaries.
//! The pipeline itself never shells out; these adapters are what callers plug
//! in when they do not bring their own media tooling.

pub mod ffmpeg;
pub mod srt;

pub use ffmpeg::{FfmpegConcatenator, FfmpegExtractor, FfmpegProbe};
pub use srt::SrtParser;
