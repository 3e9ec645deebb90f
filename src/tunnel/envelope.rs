//! Wire envelopes exchanged over a device channel.
//!
//! Every frame is a JSON object tagged by `type`:
//!
//! | `type`     | Direction        | Payload                                             |
//! |------------|------------------|-----------------------------------------------------|
//! | `register` | device → relay   | `id`                                                |
//! | `request`  | relay → device   | `id`, `method`, `path`, `headers`, `body`, `isBase64Encoded` |
//! | `response` | device → relay   | `id`, `statusCode`, `headers`, `body`, `isBase64Encoded` |

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sent once by a device after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterEnvelope {
    pub id: String,
}

/// A caller's HTTP request, encapsulated for the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub id: String,
    pub method: String,
    /// Always begins and ends with `/`.
    pub path: String,
    pub headers: IndexMap<String, String>,
    pub body: String,
    pub is_base64_encoded: bool,
}

/// A device's reply to exactly one [`RequestEnvelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub id: String,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: IndexMap<String, Value>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub is_base64_encoded: bool,
}

/// Any envelope that can travel over a device channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Register(RegisterEnvelope),
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
}

impl Envelope {
    /// Decode a single text frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encode for sending as a text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::Request(_) => "request",
            Self::Response(_) => "response",
        }
    }
}

impl ResponseEnvelope {
    /// Status reported by the device. Missing or zero means 200.
    pub fn status(&self) -> u16 {
        match self.status_code {
            Some(0) | None => 200,
            Some(code) => code,
        }
    }

    /// Decoded body bytes, or `None` when the device sent no body.
    pub fn body_bytes(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        match self.body.as_deref() {
            None | Some("") => Ok(None),
            Some(body) if self.is_base64_encoded => BASE64.decode(body).map(Some),
            Some(body) => Ok(Some(body.as_bytes().to_vec())),
        }
    }

    /// Flatten a header entry into its individual values.
    ///
    /// Strings pass through, numbers and booleans are stringified, arrays
    /// yield one value per element. Objects and `null` yield nothing.
    pub fn header_values(value: &Value) -> Vec<String> {
        match value {
            Value::String(s) => vec![s.clone()],
            Value::Number(n) => vec![n.to_string()],
            Value::Bool(b) => vec![b.to_string()],
            Value::Array(items) => items.iter().flat_map(Self::header_values).collect(),
            Value::Null | Value::Object(_) => Vec::new(),
        }
    }
}
