//! Wire protocol types for client-evaluator communication.
//!
//! Every frame is a two element MessagePack array `[code, {fields}]`. Field
//! names are camelCase. Requests the client sends and the evaluator's reverse
//! calls share one code space:
//! - **Outgoing**: CreateEvaluator, CloseEvaluator, Evaluate, and the
//!   responses to reverse calls
//! - **Incoming**: CreateEvaluatorResponse, EvaluateResponse, Log, and the
//!   reverse calls (read/list of resources and modules)

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use indexmap::IndexMap;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};

use crate::value::{DecodeError, RawValue};

/// Message codes, fixed by the evaluator's server mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageCode {
    CreateEvaluator = 0x20,
    CreateEvaluatorResponse = 0x21,
    CloseEvaluator = 0x22,
    Evaluate = 0x23,
    EvaluateResponse = 0x24,
    Log = 0x25,
    ReadResource = 0x26,
    ReadResourceResponse = 0x27,
    ReadModule = 0x28,
    ReadModuleResponse = 0x29,
    ListResources = 0x2A,
    ListResourcesResponse = 0x2B,
    ListModules = 0x2C,
    ListModulesResponse = 0x2D,
}

impl MessageCode {
    /// True for codes the client sends.
    pub fn is_outgoing(&self) -> bool {
        matches!(
            self,
            Self::CreateEvaluator
                | Self::CloseEvaluator
                | Self::Evaluate
                | Self::ReadResourceResponse
                | Self::ReadModuleResponse
                | Self::ListResourcesResponse
                | Self::ListModulesResponse
        )
    }
}

impl TryFrom<u8> for MessageCode {
    type Error = DecodeError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0x20 => Self::CreateEvaluator,
            0x21 => Self::CreateEvaluatorResponse,
            0x22 => Self::CloseEvaluator,
            0x23 => Self::Evaluate,
            0x24 => Self::EvaluateResponse,
            0x25 => Self::Log,
            0x26 => Self::ReadResource,
            0x27 => Self::ReadResourceResponse,
            0x28 => Self::ReadModule,
            0x29 => Self::ReadModuleResponse,
            0x2A => Self::ListResources,
            0x2B => Self::ListResourcesResponse,
            0x2C => Self::ListModules,
            0x2D => Self::ListModulesResponse,
            other => return Err(DecodeError::UnknownMessageCode(other)),
        })
    }
}

impl fmt::Display for MessageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:#04x})", self, *self as u8)
    }
}

/// A frame in its generic form: code plus an ordered field map.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub code: MessageCode,
    pub fields: IndexMap<String, RawValue>,
}

/// Serialize `[code, fields]` to MessagePack.
pub fn encode_message(
    code: MessageCode,
    fields: &IndexMap<String, RawValue>,
) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec(&(code as u8, fields))
}

/// Parse one `[code, fields]` frame, rejecting codes outside the protocol.
pub fn decode_message(bytes: &[u8]) -> Result<Message, DecodeError> {
    let (code, fields): (u8, IndexMap<String, RawValue>) = rmp_serde::from_slice(bytes)?;
    Ok(Message {
        code: MessageCode::try_from(code)?,
        fields,
    })
}

/// Declaration of a client resource reader sent at evaluator creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReaderSpec {
    pub scheme: String,
    pub has_hierarchical_uris: bool,
    pub is_globbable: bool,
}

/// Declaration of a client module reader sent at evaluator creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleReaderSpec {
    pub scheme: String,
    pub has_hierarchical_uris: bool,
    pub is_globbable: bool,
    pub is_local: bool,
}

/// An element within a base URI.
///
/// A path element named `bar.txt` that is not a directory, listed at
/// `file:///foo/`, stands for `file:///foo/bar.txt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathElement {
    pub name: String,
    pub is_directory: bool,
}

impl PathElement {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_directory: false,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_directory: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksums {
    pub sha256: String,
}

/// Project (or project dependency) descriptor carried by CreateEvaluator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectOrDependency {
    /// `"local"` or `"remote"`; unset for the root project.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_file_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksums: Option<Checksums>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<IndexMap<String, ProjectOrDependency>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEvaluator {
    pub request_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_resource_readers: Option<Vec<ResourceReaderSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_module_readers: Option<Vec<ModuleReaderSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_paths: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_modules: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_resources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectOrDependency>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEvaluatorResponse {
    pub request_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseEvaluator {
    pub evaluator_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluate {
    pub request_id: u64,
    pub evaluator_id: u64,
    pub module_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponse {
    pub request_id: u64,
    pub evaluator_id: u64,
    /// MessagePack encoding of the resulting value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub evaluator_id: u64,
    /// 0 for `trace()` output, 1 for warnings.
    pub level: i64,
    pub message: String,
    #[serde(default)]
    pub frame_uri: String,
}

/// Reverse call from the evaluator: read or list `uri`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    pub request_id: u64,
    pub evaluator_id: u64,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResourceResponse {
    pub request_id: u64,
    pub evaluator_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadModuleResponse {
    pub request_id: u64,
    pub evaluator_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub request_id: u64,
    pub evaluator_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_elements: Option<Vec<PathElement>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Defines a frame enum whose variants map one-to-one onto message codes,
/// with `[code, payload]` serde impls.
macro_rules! frame_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident($payload:ty) = $code:ident,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        pub enum $name {
            $($variant($payload),)+
        }

        impl $name {
            pub fn code(&self) -> MessageCode {
                match self {
                    $(Self::$variant(_) => MessageCode::$code,)+
                }
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut frame = serializer.serialize_tuple(2)?;
                frame.serialize_element(&(self.code() as u8))?;
                match self {
                    $(Self::$variant(payload) => frame.serialize_element(payload)?,)+
                }
                frame.end()
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct FrameVisitor;

                impl<'de> Visitor<'de> for FrameVisitor {
                    type Value = $name;

                    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        write!(f, "a [code, payload] {} frame", stringify!($name))
                    }

                    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<$name, A::Error> {
                        let code: u8 = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                        let code = MessageCode::try_from(code).map_err(de::Error::custom)?;
                        match code {
                            $(MessageCode::$code => {
                                let payload = seq
                                    .next_element()?
                                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                                Ok($name::$variant(payload))
                            })+
                            other => Err(de::Error::custom(format!(
                                "message code {} is not valid for {}",
                                other,
                                stringify!($name)
                            ))),
                        }
                    }
                }

                deserializer.deserialize_tuple(2, FrameVisitor)
            }
        }
    };
}

frame_enum! {
    /// Frames written by the client.
    pub enum OutgoingMessage {
        CreateEvaluator(CreateEvaluator) = CreateEvaluator,
        CloseEvaluator(CloseEvaluator) = CloseEvaluator,
        Evaluate(Evaluate) = Evaluate,
        ReadResourceResponse(ReadResourceResponse) = ReadResourceResponse,
        ReadModuleResponse(ReadModuleResponse) = ReadModuleResponse,
        ListResourcesResponse(ListResponse) = ListResourcesResponse,
        ListModulesResponse(ListResponse) = ListModulesResponse,
    }
}

frame_enum! {
    /// Frames written by the evaluator.
    pub enum IncomingMessage {
        CreateEvaluatorResponse(CreateEvaluatorResponse) = CreateEvaluatorResponse,
        EvaluateResponse(EvaluateResponse) = EvaluateResponse,
        Log(Log) = Log,
        ReadResource(ReadRequest) = ReadResource,
        ReadModule(ReadRequest) = ReadModule,
        ListResources(ReadRequest) = ListResources,
        ListModules(ReadRequest) = ListModules,
    }
}

impl IncomingMessage {
    /// Type an already framed value. Failing here only rejects this frame;
    /// the stream itself is still in sync.
    pub fn from_raw(raw: &RawValue) -> Result<Self, DecodeError> {
        let bytes = rmp_serde::to_vec(raw)?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    /// Evaluator the frame is addressed to. `None` for creation responses,
    /// which are routed by request id alone.
    pub fn evaluator_id(&self) -> Option<u64> {
        match self {
            Self::CreateEvaluatorResponse(_) => None,
            Self::EvaluateResponse(m) => Some(m.evaluator_id),
            Self::Log(m) => Some(m.evaluator_id),
            Self::ReadResource(m)
            | Self::ReadModule(m)
            | Self::ListResources(m)
            | Self::ListModules(m) => Some(m.evaluator_id),
        }
    }
}
