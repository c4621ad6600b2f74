//! Request loop run inside the worker process.
//!
//! Stdout carries protocol frames only; anything the worker wants to say goes to stderr.

use std::any::Any;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::panic::{self, AssertUnwindSafe};

use crate::codec::{Codec, EncodeSettings};
use crate::error::{Error, Result};
use crate::pixel::PixelBuffer;
use crate::protocol::{
    self, Envelope, Handshake, ImageConfig, RemoteError, RemoteErrorKind, RenderFile,
    RenderedFile, Reply, Request, Response, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, PONG,
};
use crate::registry::Registry;
use crate::render;

pub struct Server<C> {
    codec: C,
    registry: Registry,
    frame_limit: usize,
}

impl<C: Codec> Server<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            registry: Registry::standard(),
            frame_limit: protocol::MAX_FRAME_LEN,
        }
    }

    /// Largest reply payload the server will write. Never above [`protocol::MAX_FRAME_LEN`].
    pub fn with_frame_limit(mut self, limit: usize) -> Self {
        self.frame_limit = limit.min(protocol::MAX_FRAME_LEN);
        self
    }

    /// Answers one request. Errors and panics raised while handling it become error
    /// replies; nothing escapes to the request loop.
    pub fn handle(&self, request: Request) -> Reply {
        let op = request.name();
        match panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(request))) {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                tracing::debug!(op, error = %e, "request failed");
                Err(e.into())
            }
            Err(payload) => {
                let message = format!("panic occurred in {op}: {}", panic_message(payload.as_ref()));
                tracing::error!("{message}");
                Err(RemoteError::new(RemoteErrorKind::Internal, message))
            }
        }
    }

    fn dispatch(&self, request: Request) -> Result<Response> {
        match request {
            Request::Ping => Ok(Response::Pong(PONG.to_string())),
            Request::DecodeImage { data } => self.decode_image(&data),
            Request::DecodeConfig { data } => self.decode_config(&data).map(Response::DecodedConfig),
            Request::RenderFile(request) => self.render_file(request).map(Response::RenderedFile),
        }
    }

    fn decode_image(&self, data: &[u8]) -> Result<Response> {
        let decoded = self
            .codec
            .decode(data)
            .map_err(|e| Error::Decode(format!("{e:#}")))?;

        let is_jpeg = decoded.format == "jpeg";
        let buffer = PixelBuffer::from_dynamic(decoded.image, is_jpeg);
        let pixels = self.registry.encode(&buffer)?;

        Ok(Response::DecodedImage {
            format: decoded.format,
            pixels,
        })
    }

    fn decode_config(&self, data: &[u8]) -> Result<ImageConfig> {
        self.codec
            .decode_config(data)
            .map_err(|e| Error::Decode(format!("{e:#}")))
    }

    fn render_file(&self, request: RenderFile) -> Result<RenderedFile> {
        let decoded = self
            .codec
            .decode(&request.data)
            .map_err(|e| Error::Decode(format!("{e:#}")))?;
        let image = decoded.image;

        let rendered = render::render(
            request.output_format,
            request.max_file_size,
            request.quality,
            |quality| {
                let settings = EncodeSettings {
                    quality,
                    progressive: request.progressive,
                };
                self.codec
                    .encode(&image, request.output_format, settings)
                    .map_err(|e| Error::Remote(format!("{e:#}")))
            },
        )?;

        Ok(RenderedFile {
            output: rendered.output,
            original_format: decoded.format,
            new_format: request.output_format.to_string(),
            width: image.width(),
            height: image.height(),
            quality: rendered.quality,
        })
    }

    /// Writes the handshake, then answers requests until the host closes the stream.
    pub fn run<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        protocol::send(writer, &Handshake::current())?;
        tracing::debug!("handshake sent, waiting for requests");

        while let Some(frame) = protocol::read_frame(reader)? {
            let reply = match protocol::from_payload::<Envelope<Request>>(&frame) {
                Ok(Envelope { id, body }) => Envelope {
                    id,
                    body: self.handle(body),
                },
                Err(e) => {
                    tracing::error!(error = %e, "unreadable request");
                    Envelope {
                        id: 0,
                        body: Err(RemoteError::new(RemoteErrorKind::Internal, e.to_string())),
                    }
                }
            };
            let payload = self.reply_payload(reply)?;
            protocol::write_frame(writer, &payload)?;
        }

        tracing::debug!("host closed the connection");
        Ok(())
    }
}

impl<C> Server<C> {
    /// Encodes a reply, swapping one that cannot be framed for an error reply to the
    /// same call.
    fn reply_payload(&self, reply: Envelope<Reply>) -> Result<Vec<u8>> {
        match protocol::to_bounded_payload(&reply, self.frame_limit) {
            Err(Error::Decode(message)) => {
                tracing::warn!(id = reply.id, "{message}");
                let refusal: Envelope<Reply> = Envelope {
                    id: reply.id,
                    body: Err(RemoteError::new(
                        RemoteErrorKind::Decode,
                        format!("reply too large to send: {message}"),
                    )),
                };
                protocol::to_payload(&refusal)
            }
            other => other,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Entry point for worker executables: serves `codec` on stdin/stdout.
///
/// Refuses to run unless launched by a host that set the magic cookie.
pub fn serve<C: Codec>(codec: C) -> anyhow::Result<()> {
    if std::env::var(MAGIC_COOKIE_KEY).as_deref() != Ok(MAGIC_COOKIE_VALUE) {
        anyhow::bail!(
            "This binary is a sandpix worker and is not meant to be executed directly. \
             Run the program that uses it instead; it will start the worker automatically."
        );
    }

    let mut reader = BufReader::new(io::stdin().lock());
    let mut writer = BufWriter::new(io::stdout().lock());

    Server::new(codec).run(&mut reader, &mut writer)?;
    Ok(())
}
