//! Peer message envelope and CBOR codec.
//!
//! A request carries a method (topic string), an optional correlation id and
//! a typed parameter block. A reply carries the correlation id and either a
//! result block or an error string. Unknown map keys are skipped so newer
//! peers can add fields without breaking older ones.

use std::collections::BTreeMap;
use std::convert::Infallible;

use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

pub const PROTOCOL_VERSION: u32 = 1;

/// Decode-side resource bounds.
#[derive(Clone, Copy, Debug)]
pub struct WireLimits {
    pub max_map_entries: usize,
    pub max_text_len: usize,
    pub max_list_items: usize,
}

impl Default for WireLimits {
    fn default() -> Self {
        Self {
            max_map_entries: 64,
            max_text_len: 4096,
            max_list_items: 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    U64(u64),
    Text(String),
    List(Vec<String>),
}

/// Structured key/value parameter block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Params(BTreeMap<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bool(&mut self, key: &str, value: bool) -> &mut Self {
        self.0.insert(key.to_string(), Value::Bool(value));
        self
    }

    pub fn set_u64(&mut self, key: &str, value: u64) -> &mut Self {
        self.0.insert(key.to_string(), Value::U64(value));
        self
    }

    pub fn set_text(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.to_string(), Value::Text(value.into()));
        self
    }

    pub fn set_list<I, S>(&mut self, key: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.insert(
            key.to_string(),
            Value::List(values.into_iter().map(Into::into).collect()),
        );
        self
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key) {
            Some(Value::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.0.get(key) {
            Some(Value::U64(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_text(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(Value::Text(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn get_list(&self, key: &str) -> Option<&[String]> {
        match self.0.get(key) {
            Some(Value::List(values)) => Some(values.as_slice()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    /// Correlation id, present when the sender expects a reply.
    pub id: Option<u64>,
    pub params: Params,
}

impl Request {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            id: None,
            params: Params::new(),
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyResult {
    Ok(Params),
    Err(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub id: u64,
    pub result: ReplyResult,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Request(Request),
    Reply(Reply),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub version: u32,
    pub payload: Payload,
}

impl Envelope {
    pub fn request(request: Request) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: Payload::Request(request),
        }
    }

    pub fn reply(reply: Reply) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: Payload::Reply(reply),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match &self.payload {
            Payload::Request(request) => Some(request.method.as_str()),
            Payload::Reply(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtoEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("decode limit exceeded: {0}")]
    DecodeLimit(&'static str),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
    #[error("unknown payload type: {0}")]
    UnknownPayloadType(String),
    #[error("trailing bytes after envelope")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

const TYPE_REQUEST: &str = "REQUEST";
const TYPE_REPLY: &str = "REPLY";

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(3)?;
    enc.str("v")?;
    enc.u32(envelope.version)?;
    enc.str("type")?;
    match &envelope.payload {
        Payload::Request(request) => {
            enc.str(TYPE_REQUEST)?;
            enc.str("body")?;
            encode_request(&mut enc, request)?;
        }
        Payload::Reply(reply) => {
            enc.str(TYPE_REPLY)?;
            enc.str("body")?;
            encode_reply(&mut enc, reply)?;
        }
    }
    Ok(buf)
}

fn encode_request(
    enc: &mut Encoder<&mut Vec<u8>>,
    request: &Request,
) -> Result<(), ProtoEncodeError> {
    let len = if request.id.is_some() { 3 } else { 2 };
    enc.map(len)?;
    enc.str("method")?;
    enc.str(&request.method)?;
    if let Some(id) = request.id {
        enc.str("id")?;
        enc.u64(id)?;
    }
    enc.str("params")?;
    encode_params(enc, &request.params)?;
    Ok(())
}

fn encode_reply(enc: &mut Encoder<&mut Vec<u8>>, reply: &Reply) -> Result<(), ProtoEncodeError> {
    enc.map(2)?;
    enc.str("id")?;
    enc.u64(reply.id)?;
    match &reply.result {
        ReplyResult::Ok(params) => {
            enc.str("result")?;
            encode_params(enc, params)?;
        }
        ReplyResult::Err(message) => {
            enc.str("error")?;
            enc.str(message)?;
        }
    }
    Ok(())
}

fn encode_params(enc: &mut Encoder<&mut Vec<u8>>, params: &Params) -> Result<(), ProtoEncodeError> {
    enc.map(params.len() as u64)?;
    for (key, value) in params.iter() {
        enc.str(key)?;
        match value {
            Value::Bool(v) => {
                enc.bool(*v)?;
            }
            Value::U64(v) => {
                enc.u64(*v)?;
            }
            Value::Text(v) => {
                enc.str(v)?;
            }
            Value::List(items) => {
                enc.array(items.len() as u64)?;
                for item in items {
                    enc.str(item)?;
                }
            }
        }
    }
    Ok(())
}

pub fn decode_envelope(bytes: &[u8], limits: &WireLimits) -> Result<Envelope, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits)?;

    let mut version = None;
    let mut payload_type = None;
    let mut body_span = None;

    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        match key {
            "v" => version = Some(decode_u32(&mut dec, "v")?),
            "type" => {
                let raw = decode_text(&mut dec, limits)?;
                payload_type = Some(match raw {
                    TYPE_REQUEST => PayloadType::Request,
                    TYPE_REPLY => PayloadType::Reply,
                    other => {
                        return Err(ProtoDecodeError::UnknownPayloadType(other.to_string()));
                    }
                });
            }
            "body" => {
                let start = dec.position();
                dec.skip()?;
                body_span = Some((start, dec.position()));
            }
            _ => {
                if is_indefinite(&dec)? {
                    return Err(ProtoDecodeError::IndefiniteLength);
                }
                dec.skip()?;
            }
        }
    }

    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }

    let version = version.ok_or(ProtoDecodeError::MissingField("v"))?;
    let payload_type = payload_type.ok_or(ProtoDecodeError::MissingField("type"))?;
    let (start, end) = body_span.ok_or(ProtoDecodeError::MissingField("body"))?;

    let mut body = Decoder::new(&bytes[start..end]);
    let payload = match payload_type {
        PayloadType::Request => Payload::Request(decode_request(&mut body, limits)?),
        PayloadType::Reply => Payload::Reply(decode_reply(&mut body, limits)?),
    };

    Ok(Envelope { version, payload })
}

#[derive(Clone, Copy)]
enum PayloadType {
    Request,
    Reply,
}

fn decode_request(dec: &mut Decoder, limits: &WireLimits) -> Result<Request, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;

    let mut method = None;
    let mut id = None;
    let mut params = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "method" => method = Some(decode_text(dec, limits)?.to_string()),
            "id" => id = Some(dec.u64()?),
            "params" => params = Some(decode_params(dec, limits)?),
            _ => {
                if is_indefinite(dec)? {
                    return Err(ProtoDecodeError::IndefiniteLength);
                }
                dec.skip()?;
            }
        }
    }

    Ok(Request {
        method: method.ok_or(ProtoDecodeError::MissingField("method"))?,
        id,
        params: params.ok_or(ProtoDecodeError::MissingField("params"))?,
    })
}

fn decode_reply(dec: &mut Decoder, limits: &WireLimits) -> Result<Reply, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;

    let mut id = None;
    let mut result = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "id" => id = Some(dec.u64()?),
            "result" => result = Some(ReplyResult::Ok(decode_params(dec, limits)?)),
            "error" => {
                result = Some(ReplyResult::Err(decode_text(dec, limits)?.to_string()));
            }
            _ => {
                if is_indefinite(dec)? {
                    return Err(ProtoDecodeError::IndefiniteLength);
                }
                dec.skip()?;
            }
        }
    }

    Ok(Reply {
        id: id.ok_or(ProtoDecodeError::MissingField("id"))?,
        result: result.ok_or(ProtoDecodeError::MissingField("result"))?,
    })
}

fn decode_params(dec: &mut Decoder, limits: &WireLimits) -> Result<Params, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut params = Params::new();

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?.to_string();
        match dec.datatype()? {
            Type::Bool => {
                params.set_bool(&key, dec.bool()?);
            }
            Type::U8 | Type::U16 | Type::U32 | Type::U64 => {
                params.set_u64(&key, dec.u64()?);
            }
            Type::String => {
                let value = decode_text(dec, limits)?.to_string();
                params.set_text(&key, value);
            }
            Type::Array => {
                let len = decode_array_len(dec, limits)?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(decode_text(dec, limits)?.to_string());
                }
                params.set_list(&key, items);
            }
            Type::StringIndef | Type::ArrayIndef | Type::MapIndef | Type::BytesIndef => {
                return Err(ProtoDecodeError::IndefiniteLength);
            }
            other => {
                return Err(ProtoDecodeError::InvalidField {
                    field: "params",
                    reason: format!("unsupported value type {other}"),
                });
            }
        }
    }

    Ok(params)
}

fn decode_map_len(dec: &mut Decoder, limits: &WireLimits) -> Result<usize, ProtoDecodeError> {
    let len = dec.map()?;
    let Some(len) = len else {
        return Err(ProtoDecodeError::IndefiniteLength);
    };
    if len > limits.max_map_entries as u64 {
        return Err(ProtoDecodeError::DecodeLimit("max_map_entries"));
    }
    usize::try_from(len).map_err(|_| ProtoDecodeError::DecodeLimit("max_map_entries"))
}

fn decode_array_len(dec: &mut Decoder, limits: &WireLimits) -> Result<usize, ProtoDecodeError> {
    let len = dec.array()?;
    let Some(len) = len else {
        return Err(ProtoDecodeError::IndefiniteLength);
    };
    if len > limits.max_list_items as u64 {
        return Err(ProtoDecodeError::DecodeLimit("max_list_items"));
    }
    usize::try_from(len).map_err(|_| ProtoDecodeError::DecodeLimit("max_list_items"))
}

fn decode_text<'a>(
    dec: &mut Decoder<'a>,
    limits: &WireLimits,
) -> Result<&'a str, ProtoDecodeError> {
    if matches!(dec.datatype()?, Type::StringIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let s = dec.str()?;
    if s.len() > limits.max_text_len {
        return Err(ProtoDecodeError::DecodeLimit("max_text_len"));
    }
    Ok(s)
}

fn decode_u32(dec: &mut Decoder, field: &'static str) -> Result<u32, ProtoDecodeError> {
    let value = dec.u64()?;
    u32::try_from(value).map_err(|_| ProtoDecodeError::InvalidField {
        field,
        reason: format!("{value} exceeds u32"),
    })
}

fn is_indefinite(dec: &Decoder) -> Result<bool, ProtoDecodeError> {
    Ok(matches!(
        dec.datatype()?,
        Type::BytesIndef | Type::StringIndef | Type::ArrayIndef | Type::MapIndef
    ))
}
