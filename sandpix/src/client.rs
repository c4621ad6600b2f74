use std::io::Read;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::pixel::PixelBuffer;
use crate::protocol::{ImageConfig, OutputFormat, RenderFile, RenderedFile, Request, Response, PONG};
use crate::registry::Registry;
use crate::supervisor::{Supervisor, WorkerState};

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    /// Container the input was decoded from, e.g. `jpeg`.
    pub format: String,
    pub image: PixelBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub output_format: OutputFormat,
    /// Upper bound for the rendered file. `None` (or zero) means unbounded.
    pub max_file_size: Option<u64>,
    /// Starting JPEG quality, 1..=100. `None` (or zero) picks the default of 95.
    pub quality: Option<u8>,
    pub progressive: bool,
}

impl RenderOptions {
    pub fn new(output_format: OutputFormat) -> Self {
        Self {
            output_format,
            max_file_size: None,
            quality: None,
            progressive: false,
        }
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = Some(bytes);
        self
    }

    pub fn quality(mut self, quality: u8) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn progressive(mut self, progressive: bool) -> Self {
        self.progressive = progressive;
        self
    }
}

/// Handle to an isolated decoding worker.
///
/// Each client owns its own worker; nothing is shared between clients. The worker is
/// killed when the client is dropped.
pub struct Client {
    supervisor: Supervisor,
    registry: Registry,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Self {
            supervisor: Supervisor::new(),
            registry: Registry::standard(),
        }
    }

    pub fn initialize(&self, config: Config) -> Result<()> {
        self.supervisor.initialize(config)
    }

    pub fn deinitialize(&self) {
        self.supervisor.deinitialize()
    }

    pub fn state(&self) -> WorkerState {
        self.supervisor.state()
    }

    pub fn restarts(&self) -> u64 {
        self.supervisor.restarts()
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.supervisor.worker_pid()
    }

    pub fn ping(&self) -> Result<()> {
        match self.supervisor.call(Request::Ping)? {
            Response::Pong(pong) if pong == PONG => Ok(()),
            other => Err(unexpected("Ping", &other)),
        }
    }

    pub fn decode_image(&self, data: &[u8]) -> Result<DecodedImage> {
        let request = Request::DecodeImage {
            data: data.to_vec(),
        };
        match self.supervisor.call(request)? {
            Response::DecodedImage { format, pixels } => Ok(DecodedImage {
                format,
                image: self.registry.decode(&pixels)?,
            }),
            other => Err(unexpected("DecodeImage", &other)),
        }
    }

    pub fn decode_image_from<R: Read>(&self, reader: R) -> Result<DecodedImage> {
        self.decode_image(&read_input(reader)?)
    }

    /// Reads format and dimensions without transferring pixels.
    pub fn decode_config(&self, data: &[u8]) -> Result<ImageConfig> {
        let request = Request::DecodeConfig {
            data: data.to_vec(),
        };
        match self.supervisor.call(request)? {
            Response::DecodedConfig(config) => Ok(config),
            other => Err(unexpected("DecodeConfig", &other)),
        }
    }

    pub fn decode_config_from<R: Read>(&self, reader: R) -> Result<ImageConfig> {
        self.decode_config(&read_input(reader)?)
    }

    pub fn render_file(&self, data: &[u8], options: RenderOptions) -> Result<RenderedFile> {
        let request = Request::RenderFile(RenderFile {
            data: data.to_vec(),
            output_format: options.output_format,
            max_file_size: options.max_file_size.filter(|&max| max > 0),
            quality: options.quality.filter(|&q| q > 0),
            progressive: options.progressive,
        });
        match self.supervisor.call(request)? {
            Response::RenderedFile(rendered) => Ok(rendered),
            other => Err(unexpected("RenderFile", &other)),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.supervisor.deinitialize();
    }
}

fn read_input<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .map_err(|e| Error::Decode(format!("reading input: {e}")))?;
    Ok(data)
}

/// The supervisor already rejects mismatched replies; this only guards the match arms.
fn unexpected(op: &str, response: &Response) -> Error {
    Error::Transport(format!("unexpected {} reply to {op}", response.name()))
}

#[test]
fn render_options_builder() {
    let options = RenderOptions::new(OutputFormat::Jpeg)
        .max_file_size(4096)
        .quality(80)
        .progressive(true);
    assert_eq!(options.output_format, OutputFormat::Jpeg);
    assert_eq!(options.max_file_size, Some(4096));
    assert_eq!(options.quality, Some(80));
    assert!(options.progressive);
}

#[test]
fn uninitialized_client_reports_not_initialized() {
    let client = Client::new();
    assert!(matches!(client.ping(), Err(Error::NotInitialized)));
    assert!(matches!(client.decode_config(b"x"), Err(Error::NotInitialized)));
    assert_eq!(client.state(), WorkerState::Stopped);
}
