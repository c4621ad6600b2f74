//! Messages exchanged between the host and the worker, and the framing that carries them.
//!
//! Every frame is a 4-byte little-endian length followed by a MessagePack payload.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable the host sets on the worker; the worker refuses to serve without it.
pub const MAGIC_COOKIE_KEY: &str = "SANDPIX_PLUGIN";
pub const MAGIC_COOKIE_VALUE: &str = "sandpix-codec";
pub const PROTOCOL_VERSION: u32 = 1;

/// Reply to a liveness probe.
pub const PONG: &str = "Pong";

pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// First frame the worker writes after startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub cookie: String,
    pub protocol_version: u32,
}

impl Handshake {
    pub fn current() -> Self {
        Self {
            cookie: MAGIC_COOKIE_VALUE.to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn verify(&self) -> Result<()> {
        if self.cookie != MAGIC_COOKIE_VALUE {
            return Err(Error::Handshake(format!(
                "unexpected cookie {:?}, this is probably not a sandpix worker",
                self.cookie
            )));
        }
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(Error::Handshake(format!(
                "incompatible protocol version: worker speaks {}, host speaks {}",
                self.protocol_version, PROTOCOL_VERSION
            )));
        }
        Ok(())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OutputFormat {
    #[strum(to_string = "jpeg", serialize = "jpg")]
    Jpeg,
    Png,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
        }
    }

    /// Whether the encoder exposes a quality knob the render loop can turn.
    pub fn is_quality_adjustable(self) -> bool {
        matches!(self, OutputFormat::Jpeg)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Ping,
    DecodeImage {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    DecodeConfig {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    RenderFile(RenderFile),
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping => "Ping",
            Request::DecodeImage { .. } => "DecodeImage",
            Request::DecodeConfig { .. } => "DecodeConfig",
            Request::RenderFile(_) => "RenderFile",
        }
    }

    /// Whether `response` is the kind of reply this request asks for.
    pub fn accepts(&self, response: &Response) -> bool {
        matches!(
            (self, response),
            (Request::Ping, Response::Pong(_))
                | (Request::DecodeImage { .. }, Response::DecodedImage { .. })
                | (Request::DecodeConfig { .. }, Response::DecodedConfig(_))
                | (Request::RenderFile(_), Response::RenderedFile(_))
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderFile {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub output_format: OutputFormat,
    /// Only honored as a hard limit; `None` means unbounded.
    pub max_file_size: Option<u64>,
    /// 1..=100, only used by quality-adjustable formats.
    pub quality: Option<u8>,
    pub progressive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Pong(String),
    DecodedImage {
        format: String,
        /// Registry-encoded [`PixelBuffer`](crate::pixel::PixelBuffer).
        #[serde(with = "serde_bytes")]
        pixels: Vec<u8>,
    },
    DecodedConfig(ImageConfig),
    RenderedFile(RenderedFile),
}

impl Response {
    pub fn name(&self) -> &'static str {
        match self {
            Response::Pong(_) => "Pong",
            Response::DecodedImage { .. } => "DecodedImage",
            Response::DecodedConfig(_) => "DecodedConfig",
            Response::RenderedFile(_) => "RenderedFile",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub format: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedFile {
    #[serde(with = "serde_bytes")]
    pub output: Vec<u8>,
    pub original_format: String,
    pub new_format: String,
    pub width: u32,
    pub height: u32,
    /// Quality that satisfied the size constraint, for quality-adjustable formats.
    pub quality: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    Decode,
    UnknownVariant(u8),
    SizeConstraint(u64),
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<Error> for RemoteError {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::Decode(_) => RemoteErrorKind::Decode,
            Error::UnknownVariant(tag) => RemoteErrorKind::UnknownVariant(*tag),
            Error::SizeConstraintUnsatisfiable { max_file_size } => {
                RemoteErrorKind::SizeConstraint(*max_file_size)
            }
            _ => RemoteErrorKind::Internal,
        };
        RemoteError::new(kind, e.to_string())
    }
}

pub type Reply = std::result::Result<Response, RemoteError>;

/// A request or reply tagged with the id of the call it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: u64,
    pub body: T,
}

pub fn write_frame<W: Write + ?Sized>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds limit", payload.len()),
            )
        })?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Reads one frame. Returns `Ok(None)` on a clean end of stream between frames.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

pub fn to_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| Error::Transport(format!("encoding message: {e}")))
}

pub fn from_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    rmp_serde::from_slice(payload).map_err(|e| Error::Transport(format!("decoding message: {e}")))
}

/// Encodes `value`, refusing payloads larger than `limit`.
///
/// An oversized message is a property of the data being carried, so it is reported as
/// [`Error::Decode`] and leaves the connection usable.
pub fn to_bounded_payload<T: Serialize>(value: &T, limit: usize) -> Result<Vec<u8>> {
    let payload = to_payload(value)?;
    if payload.len() > limit {
        return Err(Error::Decode(format!(
            "message of {} bytes exceeds the {limit} byte frame limit",
            payload.len()
        )));
    }
    Ok(payload)
}

pub fn send<W: Write + ?Sized, T: Serialize>(writer: &mut W, value: &T) -> Result<()> {
    let payload = to_payload(value)?;
    write_frame(writer, &payload)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_survive_a_byte_stream() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"first").unwrap();
        write_frame(&mut wire, b"").unwrap();
        write_frame(&mut wire, b"third").unwrap();

        let mut reader = Cursor::new(wire);
        assert_eq!(read_frame(&mut reader).unwrap().as_deref(), Some(&b"first"[..]));
        assert_eq!(read_frame(&mut reader).unwrap().as_deref(), Some(&b""[..]));
        assert_eq!(read_frame(&mut reader).unwrap().as_deref(), Some(&b"third"[..]));
        assert_eq!(read_frame(&mut reader).unwrap(), None);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"complete payload").unwrap();
        wire.truncate(10);
        assert!(read_frame(&mut Cursor::new(&wire)).is_err());
        assert!(read_frame(&mut Cursor::new(&wire[..2])).is_err());
    }

    #[test]
    fn oversized_length_is_rejected_before_allocating() {
        let header = u32::MAX.to_le_bytes();
        let err = read_frame(&mut Cursor::new(header)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn handshake_checks_cookie_then_version() {
        assert!(Handshake::current().verify().is_ok());

        let wrong_cookie = Handshake {
            cookie: "libheif".into(),
            ..Handshake::current()
        };
        assert!(matches!(wrong_cookie.verify(), Err(Error::Handshake(_))));

        let wrong_version = Handshake {
            protocol_version: PROTOCOL_VERSION + 1,
            ..Handshake::current()
        };
        assert!(matches!(wrong_version.verify(), Err(Error::Handshake(_))));
    }

    #[test]
    fn output_format_parses_common_spellings() {
        assert_eq!("jpg".parse::<OutputFormat>().unwrap(), OutputFormat::Jpeg);
        assert_eq!("JPEG".parse::<OutputFormat>().unwrap(), OutputFormat::Jpeg);
        assert_eq!("png".parse::<OutputFormat>().unwrap(), OutputFormat::Png);
        assert!("webp".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::Jpeg.to_string(), "jpeg");
    }

    #[test]
    fn oversized_messages_are_refused_before_writing() {
        let request = Envelope {
            id: 3,
            body: Request::DecodeImage { data: vec![0; 4096] },
        };
        let err = to_bounded_payload(&request, 1024).unwrap_err();
        assert!(matches!(err, Error::Decode(_)), "{err}");
        assert!(!err.is_worker_fault());

        let payload = to_bounded_payload(&request, MAX_FRAME_LEN).unwrap();
        assert_eq!(from_payload::<Envelope<Request>>(&payload).unwrap(), request);
    }

    #[test]
    fn requests_accept_only_their_reply_kind() {
        let pong = Response::Pong(PONG.to_string());
        let config = Response::DecodedConfig(ImageConfig {
            format: "png".into(),
            width: 1,
            height: 1,
        });
        assert!(Request::Ping.accepts(&pong));
        assert!(!Request::Ping.accepts(&config));
        assert!(Request::DecodeConfig { data: vec![] }.accepts(&config));
        assert!(!Request::DecodeImage { data: vec![] }.accepts(&config));
    }

    #[test]
    fn envelopes_round_trip_errors() {
        let reply: Envelope<Reply> = Envelope {
            id: 7,
            body: Err(RemoteError::new(RemoteErrorKind::SizeConstraint(1024), "too big")),
        };
        let payload = to_payload(&reply).unwrap();
        let back: Envelope<Reply> = from_payload(&payload).unwrap();
        assert_eq!(back, reply);
    }
}
