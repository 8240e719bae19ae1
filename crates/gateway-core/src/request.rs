use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Decrypt,
    Sign,
    ExportKey,
    GetKeyByName,
    Digest,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decrypt => "decrypt",
            Self::Sign => "sign",
            Self::ExportKey => "exportKey",
            Self::GetKeyByName => "getKeyByName",
            Self::Digest => "digest",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Algorithm descriptor: a name plus whatever parameters came with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Algorithm {
    pub name: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Algorithm {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }
}

/// Backend-assigned key identifier. Never key material.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated `key` argument: the backend id plus the descriptor's other
/// public attributes, forwarded as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyReference {
    pub id: KeyId,
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Public,
    Private,
    Secret,
}

/// What `getKeyByName` resolves with. Serialises to the shape callers hand
/// back as the `key` argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyDescriptor {
    #[serde(rename = "cs_pkcs11id")]
    pub id: KeyId,
    pub name: String,
    #[serde(rename = "type")]
    pub key_type: KeyType,
    pub algorithm: Algorithm,
    pub usages: Vec<String>,
    pub extractable: bool,
}

impl KeyDescriptor {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExportedKey {
    Raw(Vec<u8>),
    Jwk(Map<String, Value>),
}

/// Normalized arguments for `decrypt` and `sign`.
#[derive(Debug, Clone, PartialEq)]
pub struct CipherArgs {
    pub algorithm: Algorithm,
    pub key: KeyReference,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportArgs {
    pub format: String,
    pub key: KeyReference,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyLookupArgs {
    /// `None` asks for the backend's default key.
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DigestArgs {
    pub plaintext: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedArgs {
    Decrypt(CipherArgs),
    Sign(CipherArgs),
    ExportKey(ExportArgs),
    GetKeyByName(KeyLookupArgs),
    Digest(DigestArgs),
}

impl NormalizedArgs {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Decrypt(_) => OperationKind::Decrypt,
            Self::Sign(_) => OperationKind::Sign,
            Self::ExportKey(_) => OperationKind::ExportKey,
            Self::GetKeyByName(_) => OperationKind::GetKeyByName,
            Self::Digest(_) => OperationKind::Digest,
        }
    }
}
