// 播放器核心模块

pub mod backend;
pub mod audio_output;
pub mod presenter;
pub mod buffering;
pub(crate) mod pipeline;
mod demuxer_thread;
mod decoder;
mod video_output;
pub mod manager;
pub mod synthetic;

pub use backend::{AudioDecoder, DemuxEvent, Demuxer, MediaBackend, PlainStreamProvider, StreamProvider, VideoDecoder};
pub use audio_output::{AudioEvent, AudioSink, SoftwareAudioSink};
pub use presenter::{ThreadPresenter, VideoPresenter};
pub use buffering::{BufferLevel, BufferLevels, UnderrunMonitor};
pub use pipeline::FlushReport;
pub use manager::{Player, PlayerCtl, PlayerStats};
pub use synthetic::{SyntheticBackend, SyntheticSpec};
