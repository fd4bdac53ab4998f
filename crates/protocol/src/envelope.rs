use serde::{Deserialize, Serialize};

use crate::constants::MethodName;

/// Errors raised while decoding an inbound envelope.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown method: {0}")]
    UnknownMethod(String),
}

/// Envelope for every text frame exchanged with devices and upstream.
///
/// `body` is kept as a `RawValue` so that routing never pays for decoding
/// a payload it does not understand; handlers call [`Envelope::parse_body`]
/// with the type they expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub method_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Box<serde_json::value::RawValue>>,
}

impl Envelope {
    /// Creates an envelope for a known method with an optional body.
    pub fn new<T: Serialize>(method: MethodName, body: Option<&T>) -> Result<Self, serde_json::Error> {
        let raw = match body {
            Some(b) => {
                let json = serde_json::to_string(b)?;
                Some(serde_json::value::RawValue::from_string(json)?)
            }
            None => None,
        };
        Ok(Self {
            method_name: method.as_str().to_string(),
            body: raw,
        })
    }

    /// Parses a text frame into an envelope without checking the method.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes the envelope into a text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Resolves the method name against the closed [`MethodName`] set.
    pub fn method(&self) -> Result<MethodName, ProtocolError> {
        self.method_name.parse()
    }

    /// Deserializes the body into the given type.
    pub fn parse_body<T: for<'de> Deserialize<'de>>(&self) -> Result<Option<T>, serde_json::Error> {
        match &self.body {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }

    /// Raw JSON text of the body, if any.
    pub fn body_json(&self) -> Option<&str> {
        self.body.as_deref().map(|raw| raw.get())
    }
}
