//! Multiplexing engine for camera recordings.
//!
//! Encoded frames arrive from capture threads through a [`SessionSink`], are parked
//! in fixed-size cell pools, and are handed to one [`ContainerWriter`] per stream in
//! timestamp order by that stream's worker thread. Workers split output into
//! duration-bounded files and embed a preview thumbnail in each one.

mod bridge;
mod cell;
mod config;
mod queue;
mod session;
mod split;
mod thumbnail;
mod worker;
pub mod writer;

pub use bridge::{
    CallbackError, MediaPipeline, MuxerEvent, NoopPipeline, SessionCallbacks, StreamHandle,
};
pub use cell::{Frame, PoolKind, PoolStats};
pub use config::{ConfigError, MAX_STREAMS, PoolConfig, SessionAttr, StreamConfig};
pub use session::{Session, SessionContext, SessionError, SessionSink, SubmitError};
pub use split::SplitPolicy;
pub use thumbnail::{BoxError, ThumbnailBox};
pub use worker::{IN_PROGRESS_SUFFIX, StreamStats, in_progress_path};
pub use writer::{ContainerWriter, EsFileWriter, WriterError, WriterFactory};

pub use camrec_media_info as media_info;
