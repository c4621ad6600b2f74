//! Decode and render images in a separate worker process.
//!
//! Native image codecs can crash or corrupt memory on hostile input. sandpix keeps them
//! out of the host process: a [`Client`] spawns a worker executable, checks it with a
//! handshake and a ping before every call, and restarts it once if it stops answering.

pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod pixel;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod render;
pub mod server;
pub mod supervisor;

// Re-export commonly used types
pub use client::{Client, DecodedImage, RenderOptions};
pub use config::{Command, Config};
pub use error::{Error, Result};
pub use pixel::PixelBuffer;
pub use protocol::{ImageConfig, OutputFormat, RenderedFile};
pub use registry::{Registry, VariantTag};
pub use supervisor::WorkerState;
