use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Cursor, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use rmpv::Value;

use crate::config::AppConfig;
use crate::wire::envelope::{Envelope, EnvelopeError};

pub const DEFAULT_MAX_FRAME_SIZE_BYTES: usize = 8 * 1024 * 1024;
pub const FRAME_HEADER_SIZE_BYTES: usize = 4;

pub type RawMessage = BTreeMap<String, Value>;

/// One transport message without its length prefix. Hosts that distinguish
/// text and binary messages hand them over as such; raw TCP only produces
/// `Binary`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Binary(bytes) => bytes,
            Self::Text(text) => text.as_bytes(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireFormat {
    MessagePack,
    Json,
}

impl WireFormat {
    pub fn from_config_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "msgpack" | "messagepack" => Some(Self::MessagePack),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessagePack => "msgpack",
            Self::Json => "json",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    pub fn from_config_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Some(Self::None),
            "gzip" => Some(Self::Gzip),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
        }
    }
}

#[derive(Debug)]
pub enum CodecError {
    PayloadTooLarge { size: usize, limit: usize },
    ProtocolZeroLength,
    ProtocolLengthTooLarge { length: usize, limit: usize },
    MessagePackEncode(rmpv::encode::Error),
    MessagePackDecode(rmpv::decode::Error),
    Json(serde_json::Error),
    Compression(io::Error),
    TrailingDataInPayload,
    MessageMustBeMap,
    MapKeyMustBeUtf8String,
    UnsupportedValue { kind: &'static str },
    Envelope(EnvelopeError),
    UnknownFormat { value: String },
    UnknownCompression { value: String },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::ProtocolZeroLength => {
                write!(f, "protocol error: frame length cannot be zero")
            }
            Self::ProtocolLengthTooLarge { length, limit } => write!(
                f,
                "protocol error: frame length {length} exceeds max {limit}"
            ),
            Self::MessagePackEncode(source) => write!(f, "messagepack encode error: {source}"),
            Self::MessagePackDecode(source) => write!(f, "messagepack decode error: {source}"),
            Self::Json(source) => write!(f, "json codec error: {source}"),
            Self::Compression(source) => write!(f, "gzip codec error: {source}"),
            Self::TrailingDataInPayload => write!(f, "payload contains trailing MessagePack data"),
            Self::MessageMustBeMap => write!(f, "message must be a map"),
            Self::MapKeyMustBeUtf8String => write!(f, "map keys must be UTF-8 strings"),
            Self::UnsupportedValue { kind } => {
                write!(f, "{kind} values cannot be carried by the JSON wire format")
            }
            Self::Envelope(source) => write!(f, "envelope error: {source}"),
            Self::UnknownFormat { value } => {
                write!(f, "unknown wire format '{value}', expected msgpack or json")
            }
            Self::UnknownCompression { value } => {
                write!(f, "unknown wire compression '{value}', expected none or gzip")
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Envelope encode/decode capability attached to a session.
///
/// Implementations may keep mutable scratch state, so an instance is never
/// shared between threads: every worker serving a session holds its own
/// `duplicate()`.
pub trait Codec: Send {
    fn decode(&mut self, frame: &Frame) -> Result<Envelope, CodecError>;
    fn encode(&mut self, envelope: &Envelope) -> Result<Frame, CodecError>;
    fn duplicate(&self) -> Box<dyn Codec>;
    fn configure(&mut self, format: WireFormat, compression: Compression);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecConfig {
    pub format: WireFormat,
    pub compression: Compression,
    pub max_frame_size_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            format: WireFormat::MessagePack,
            compression: Compression::None,
            max_frame_size_bytes: DEFAULT_MAX_FRAME_SIZE_BYTES,
        }
    }
}

impl CodecConfig {
    pub fn from_app_config(app_config: &AppConfig) -> Result<Self, CodecError> {
        let format = WireFormat::from_config_value(&app_config.wire.format).ok_or_else(|| {
            CodecError::UnknownFormat {
                value: app_config.wire.format.clone(),
            }
        })?;
        let compression = Compression::from_config_value(&app_config.wire.compression)
            .ok_or_else(|| CodecError::UnknownCompression {
                value: app_config.wire.compression.clone(),
            })?;

        Ok(Self {
            format,
            compression,
            max_frame_size_bytes: app_config.wire.max_frame_size_bytes.max(1),
        })
    }
}

#[derive(Clone, Debug)]
pub struct WireCodec {
    config: CodecConfig,
    scratch: Vec<u8>,
}

impl WireCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            config,
            scratch: Vec::new(),
        }
    }

    pub fn config(&self) -> CodecConfig {
        self.config
    }

    pub fn max_frame_size_bytes(&self) -> usize {
        self.config.max_frame_size_bytes
    }

    fn check_size(&self, size: usize) -> Result<(), CodecError> {
        if size > self.config.max_frame_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size,
                limit: self.config.max_frame_size_bytes,
            });
        }
        Ok(())
    }

    fn decode_bytes(&mut self, bytes: &[u8]) -> Result<RawMessage, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::ProtocolZeroLength);
        }
        self.check_size(bytes.len())?;

        let inflated;
        let body = match self.config.compression {
            Compression::None => bytes,
            Compression::Gzip => {
                self.scratch.clear();
                GzDecoder::new(bytes)
                    .take(self.config.max_frame_size_bytes as u64 + 1)
                    .read_to_end(&mut self.scratch)
                    .map_err(CodecError::Compression)?;
                self.check_size(self.scratch.len())?;
                inflated = std::mem::take(&mut self.scratch);
                inflated.as_slice()
            }
        };

        match self.config.format {
            WireFormat::MessagePack => decode_msgpack(body),
            WireFormat::Json => decode_json(body),
        }
    }
}

impl Codec for WireCodec {
    fn decode(&mut self, frame: &Frame) -> Result<Envelope, CodecError> {
        let raw = match frame {
            // Text frames are always plain JSON, whatever the binary settings.
            Frame::Text(text) => {
                self.check_size(text.len())?;
                decode_json(text.as_bytes())?
            }
            Frame::Binary(bytes) => self.decode_bytes(bytes)?,
        };

        Envelope::from_raw(&raw).map_err(CodecError::Envelope)
    }

    fn encode(&mut self, envelope: &Envelope) -> Result<Frame, CodecError> {
        let raw = envelope.clone().into_raw();
        let body = match self.config.format {
            WireFormat::MessagePack => {
                self.scratch.clear();
                rmpv::encode::write_value(&mut self.scratch, &raw_to_value(raw))
                    .map_err(CodecError::MessagePackEncode)?;
                self.scratch.clone()
            }
            WireFormat::Json => {
                serde_json::to_vec(&raw_to_json(&raw)?).map_err(CodecError::Json)?
            }
        };

        let frame = match (self.config.compression, self.config.format) {
            (Compression::Gzip, _) => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(&body).map_err(CodecError::Compression)?;
                Frame::Binary(encoder.finish().map_err(CodecError::Compression)?)
            }
            (Compression::None, WireFormat::Json) => {
                Frame::Text(String::from_utf8(body).map_err(|_| CodecError::UnsupportedValue {
                    kind: "non UTF-8 JSON",
                })?)
            }
            (Compression::None, WireFormat::MessagePack) => Frame::Binary(body),
        };

        self.check_size(frame.len())?;
        Ok(frame)
    }

    fn duplicate(&self) -> Box<dyn Codec> {
        Box::new(Self::new(self.config))
    }

    fn configure(&mut self, format: WireFormat, compression: Compression) {
        self.config.format = format;
        self.config.compression = compression;
    }
}

/// Prepends the 4-byte big-endian length header used on TCP connections.
pub fn encode_length_prefixed(payload: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::ProtocolZeroLength);
    }
    if payload.len() > limit {
        return Err(CodecError::PayloadTooLarge {
            size: payload.len(),
            limit,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Removes one complete length-prefixed frame from the front of `buffer`.
/// Returns `Ok(None)` while the frame is still incomplete.
pub fn take_length_prefixed(buffer: &mut Vec<u8>, limit: usize) -> Result<Option<Vec<u8>>, CodecError> {
    if buffer.len() < FRAME_HEADER_SIZE_BYTES {
        return Ok(None);
    }

    let declared_len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if declared_len == 0 {
        return Err(CodecError::ProtocolZeroLength);
    }
    if declared_len > limit {
        return Err(CodecError::ProtocolLengthTooLarge {
            length: declared_len,
            limit,
        });
    }
    if buffer.len() < FRAME_HEADER_SIZE_BYTES + declared_len {
        return Ok(None);
    }

    let payload = buffer[FRAME_HEADER_SIZE_BYTES..FRAME_HEADER_SIZE_BYTES + declared_len].to_vec();
    buffer.drain(..FRAME_HEADER_SIZE_BYTES + declared_len);
    Ok(Some(payload))
}

fn decode_msgpack(payload: &[u8]) -> Result<RawMessage, CodecError> {
    let mut cursor = Cursor::new(payload);
    let value = rmpv::decode::read_value(&mut cursor).map_err(CodecError::MessagePackDecode)?;
    if cursor.position() as usize != payload.len() {
        return Err(CodecError::TrailingDataInPayload);
    }

    value_to_raw(value)
}

fn decode_json(payload: &[u8]) -> Result<RawMessage, CodecError> {
    let value: serde_json::Value = serde_json::from_slice(payload).map_err(CodecError::Json)?;
    value_to_raw(json_to_value(value))
}

fn raw_to_value(raw: RawMessage) -> Value {
    Value::Map(
        raw.into_iter()
            .map(|(key, value)| (Value::String(key.into()), value))
            .collect(),
    )
}

fn value_to_raw(value: Value) -> Result<RawMessage, CodecError> {
    let Value::Map(entries) = value else {
        return Err(CodecError::MessageMustBeMap);
    };

    let mut raw = RawMessage::new();
    for (key, value) in entries {
        let Value::String(text) = key else {
            return Err(CodecError::MapKeyMustBeUtf8String);
        };
        let Some(text) = text.as_str() else {
            return Err(CodecError::MapKeyMustBeUtf8String);
        };
        raw.insert(text.to_owned(), value);
    }

    Ok(raw)
}

fn raw_to_json(raw: &RawMessage) -> Result<serde_json::Value, CodecError> {
    let mut map = serde_json::Map::new();
    for (key, value) in raw {
        map.insert(key.clone(), value_to_json(value)?);
    }
    Ok(serde_json::Value::Object(map))
}

pub fn value_to_json(value: &Value) -> Result<serde_json::Value, CodecError> {
    match value {
        Value::Nil => Ok(serde_json::Value::Null),
        Value::Boolean(v) => Ok(serde_json::Value::Bool(*v)),
        Value::Integer(v) => {
            if let Some(raw) = v.as_i64() {
                Ok(serde_json::json!(raw))
            } else if let Some(raw) = v.as_u64() {
                Ok(serde_json::json!(raw))
            } else {
                Err(CodecError::UnsupportedValue { kind: "integer" })
            }
        }
        // JSON numbers come back as F64, so F32 would not survive a round trip.
        Value::F32(_) => Err(CodecError::UnsupportedValue {
            kind: "32-bit float",
        }),
        Value::F64(v) => serde_json::Number::from_f64(*v)
            .map(serde_json::Value::Number)
            .ok_or(CodecError::UnsupportedValue {
                kind: "non-finite float",
            }),
        Value::String(v) => v
            .as_str()
            .map(|text| serde_json::Value::String(text.to_owned()))
            .ok_or(CodecError::UnsupportedValue {
                kind: "non UTF-8 string",
            }),
        Value::Binary(_) => Err(CodecError::UnsupportedValue { kind: "binary" }),
        Value::Array(values) => values
            .iter()
            .map(value_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(serde_json::Value::Array),
        Value::Map(entries) => {
            let mut map = serde_json::Map::new();
            for (key, value) in entries {
                let Some(text_key) = key.as_str() else {
                    return Err(CodecError::MapKeyMustBeUtf8String);
                };
                map.insert(text_key.to_owned(), value_to_json(value)?);
            }
            Ok(serde_json::Value::Object(map))
        }
        Value::Ext(_, _) => Err(CodecError::UnsupportedValue {
            kind: "MessagePack extension",
        }),
    }
}

pub fn json_to_value(value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(v) => Value::Boolean(v),
        serde_json::Value::Number(number) => {
            if let Some(v) = number.as_i64() {
                Value::Integer(v.into())
            } else if let Some(v) = number.as_u64() {
                Value::Integer(v.into())
            } else {
                Value::F64(number.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(v) => Value::String(v.into()),
        serde_json::Value::Array(values) => {
            Value::Array(values.into_iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(map) => Value::Map(
            map.into_iter()
                .map(|(key, value)| (Value::String(key.into()), json_to_value(value)))
                .collect(),
        ),
    }
}
