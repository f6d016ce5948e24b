//! File encoders
//!
//! Concrete [`SampleSink`](crate::recorder::writer::SampleSink)
//! implementations backed by an external ffmpeg process.

pub mod ffmpeg;

pub use ffmpeg::{check_ffmpeg, FfmpegAudioSink, FfmpegSinkFactory, FfmpegVideoSink, VideoEncodeConfig};
