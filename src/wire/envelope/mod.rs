use std::collections::BTreeMap;
use std::fmt;

use rmpv::Value;

use crate::wire::codec::RawMessage;

pub type ParameterMap = BTreeMap<String, Value>;

pub const ID_FIELD: &str = "id";
pub const TYPE_FIELD: &str = "type";
pub const PAYLOAD_FIELD: &str = "payload";
pub const PARAMETERS_FIELD: &str = "parameters";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ProcedureCall,
    DirectQuery,
    Ping,
    Pong,
    StoreProcedure,
    DeleteProcedure,
    Authenticate,
    Configure,
    Result,
    Success,
    Error,
}

impl MessageKind {
    pub const ALL: [MessageKind; 11] = [
        Self::ProcedureCall,
        Self::DirectQuery,
        Self::Ping,
        Self::Pong,
        Self::StoreProcedure,
        Self::DeleteProcedure,
        Self::Authenticate,
        Self::Configure,
        Self::Result,
        Self::Success,
        Self::Error,
    ];

    pub fn code(self) -> i64 {
        match self {
            Self::ProcedureCall => 1,
            Self::DirectQuery => 2,
            Self::Ping => 3,
            Self::Pong => 4,
            Self::StoreProcedure => 5,
            Self::DeleteProcedure => 6,
            Self::Authenticate => 7,
            Self::Configure => 8,
            Self::Result => 9,
            Self::Success => 10,
            Self::Error => 11,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProcedureCall => "PROCEDURE_CALL",
            Self::DirectQuery => "DIRECT_QUERY",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::StoreProcedure => "STORE_PROCEDURE",
            Self::DeleteProcedure => "DELETE_PROCEDURE",
            Self::Authenticate => "AUTHENTICATE",
            Self::Configure => "CONFIGURE",
            Self::Result => "RESULT",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
        }
    }

    /// Kinds an unauthenticated session may still have serviced.
    pub fn allowed_unauthenticated(self) -> bool {
        matches!(
            self,
            Self::Ping | Self::Pong | Self::Authenticate | Self::Configure | Self::Error
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One correlated request or response unit.
///
/// `id` is chosen by the client and echoed on every response to that request.
/// `kind` decides how `payload` and `parameters` are read.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub id: i64,
    pub kind: MessageKind,
    pub payload: Value,
    pub parameters: ParameterMap,
}

#[derive(Debug, PartialEq)]
pub enum EnvelopeError {
    MissingField { field: &'static str },
    InvalidFieldType { field: &'static str, expected: &'static str },
    IntegerOutOfRange { field: &'static str },
    UnknownMessageKind { code: i64 },
    ParameterKeyMustBeUtf8String,
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "missing envelope field '{field}'"),
            Self::InvalidFieldType { field, expected } => {
                write!(f, "invalid field type for '{field}', expected {expected}")
            }
            Self::IntegerOutOfRange { field } => {
                write!(f, "integer field '{field}' must fit signed int64")
            }
            Self::UnknownMessageKind { code } => write!(f, "unknown message type code {code}"),
            Self::ParameterKeyMustBeUtf8String => {
                write!(f, "parameter map keys must be UTF-8 strings")
            }
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl Envelope {
    pub fn new(id: i64, kind: MessageKind) -> Self {
        Self {
            id,
            kind,
            payload: Value::Nil,
            parameters: ParameterMap::new(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = payload.into();
        self
    }

    #[cfg(test)]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn error(id: i64, message: impl Into<String>) -> Self {
        Self::new(id, MessageKind::Error).with_payload(Value::String(message.into().into()))
    }

    pub fn success(id: i64) -> Self {
        Self::new(id, MessageKind::Success)
    }

    pub fn pong(id: i64) -> Self {
        Self::new(id, MessageKind::Pong)
    }

    pub fn result(id: i64, payload: Value) -> Self {
        Self::new(id, MessageKind::Result).with_payload(payload)
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    pub fn string_parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    pub fn payload_str(&self) -> Option<&str> {
        self.payload.as_str()
    }

    /// Renders the payload for log lines and error messages.
    pub fn payload_text(&self) -> String {
        match &self.payload {
            Value::String(text) => text.as_str().unwrap_or_default().to_owned(),
            Value::Nil => String::new(),
            other => other.to_string(),
        }
    }

    pub fn from_raw(raw: &RawMessage) -> Result<Self, EnvelopeError> {
        let id = parse_i64(raw.get(ID_FIELD), ID_FIELD)?;
        let code = parse_i64(raw.get(TYPE_FIELD), TYPE_FIELD)?;
        let kind = MessageKind::from_code(code).ok_or(EnvelopeError::UnknownMessageKind { code })?;
        let payload = raw.get(PAYLOAD_FIELD).cloned().unwrap_or(Value::Nil);
        let parameters = parse_parameter_map(raw.get(PARAMETERS_FIELD))?;

        Ok(Self {
            id,
            kind,
            payload,
            parameters,
        })
    }

    pub fn into_raw(self) -> RawMessage {
        let mut raw = RawMessage::new();
        raw.insert(ID_FIELD.to_owned(), Value::Integer(self.id.into()));
        raw.insert(TYPE_FIELD.to_owned(), Value::Integer(self.kind.code().into()));
        raw.insert(PAYLOAD_FIELD.to_owned(), self.payload);

        let parameters = self
            .parameters
            .into_iter()
            .map(|(k, v)| (Value::String(k.into()), v))
            .collect::<Vec<_>>();
        raw.insert(PARAMETERS_FIELD.to_owned(), Value::Map(parameters));

        raw
    }
}

pub(crate) fn parse_i64(value: Option<&Value>, field: &'static str) -> Result<i64, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingField { field })?;
    let Value::Integer(integer) = value else {
        return Err(EnvelopeError::InvalidFieldType {
            field,
            expected: "int",
        });
    };

    if let Some(v) = integer.as_i64() {
        return Ok(v);
    }

    match integer.as_u64() {
        Some(v) if v <= i64::MAX as u64 => Ok(v as i64),
        _ => Err(EnvelopeError::IntegerOutOfRange { field }),
    }
}

fn parse_parameter_map(value: Option<&Value>) -> Result<ParameterMap, EnvelopeError> {
    let entries = match value {
        None | Some(Value::Nil) => return Ok(ParameterMap::new()),
        Some(Value::Map(entries)) => entries,
        Some(_) => {
            return Err(EnvelopeError::InvalidFieldType {
                field: PARAMETERS_FIELD,
                expected: "map",
            })
        }
    };

    let mut parameters = ParameterMap::new();
    for (key, value) in entries {
        let Some(text) = key.as_str() else {
            return Err(EnvelopeError::ParameterKeyMustBeUtf8String);
        };

        parameters.insert(text.to_owned(), value.clone());
    }

    Ok(parameters)
}
