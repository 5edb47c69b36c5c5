//! Recording lifecycle management.
//!
//! [`RecorderManager`] owns the map of in-flight recordings and supervises
//! one external encoder process per (camera, schedule) pair.

pub mod encoder;
pub mod manager;
pub mod retry;
pub mod watchdog;

pub use encoder::{
    Encoder, EncoderEvent, EncoderHandle, EncoderJob, FfmpegEncoder, FfmpegEncoderConfig,
    is_fatal_stderr, segment_file_prefix,
};
pub use manager::{
    ActiveRecordingInfo, RecorderConfig, RecorderEvent, RecorderManager, StopReason,
};
pub use retry::RetryTracker;
