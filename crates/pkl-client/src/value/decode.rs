//! Tagged-union codec between `RawValue` and `Value`.
//!
//! A composite travels as an array whose first element is a tag and whose
//! remaining elements are that tag's fixed-arity payload. Everything else is
//! a MessagePack primitive passed through unchanged.

use indexmap::IndexMap;

use super::{
    DataSize, DataSizeUnit, Duration, DurationUnit, DynamicObject, IntSeq, RawValue, Regex,
    TypedObject, Value,
};

/// Class name and module that mark an object as `Dynamic`.
const DYNAMIC_CLASS: &str = "Dynamic";
const DYNAMIC_MODULE: &str = "pkl:base";

/// Composite value tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Object = 0x01,
    Map = 0x02,
    Mapping = 0x03,
    List = 0x04,
    Listing = 0x05,
    Set = 0x06,
    Duration = 0x07,
    DataSize = 0x08,
    Pair = 0x09,
    IntSeq = 0x0A,
    Regex = 0x0B,
    Class = 0x0C,
    TypeAlias = 0x0D,
}

impl Tag {
    pub fn from_i64(tag: i64) -> Option<Self> {
        Some(match tag {
            0x01 => Self::Object,
            0x02 => Self::Map,
            0x03 => Self::Mapping,
            0x04 => Self::List,
            0x05 => Self::Listing,
            0x06 => Self::Set,
            0x07 => Self::Duration,
            0x08 => Self::DataSize,
            0x09 => Self::Pair,
            0x0A => Self::IntSeq,
            0x0B => Self::Regex,
            0x0C => Self::Class,
            0x0D => Self::TypeAlias,
            _ => return None,
        })
    }

    /// Number of payload elements after the tag. `None` means any.
    fn arity(&self) -> Option<usize> {
        match self {
            Self::Object | Self::IntSeq => Some(3),
            Self::Duration | Self::DataSize | Self::Pair => Some(2),
            Self::Map | Self::Mapping | Self::List | Self::Listing | Self::Set | Self::Regex => {
                Some(1)
            }
            Self::Class | Self::TypeAlias => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Map => "map",
            Self::Mapping => "mapping",
            Self::List => "list",
            Self::Listing => "listing",
            Self::Set => "set",
            Self::Duration => "duration",
            Self::DataSize => "data size",
            Self::Pair => "pair",
            Self::IntSeq => "int seq",
            Self::Regex => "regex",
            Self::Class => "class",
            Self::TypeAlias => "type alias",
        }
    }
}

/// Object member sub-tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemberTag {
    Property = 0x10,
    Entry = 0x11,
    Element = 0x12,
}

impl MemberTag {
    pub fn from_i64(tag: i64) -> Option<Self> {
        Some(match tag {
            0x10 => Self::Property,
            0x11 => Self::Entry,
            0x12 => Self::Element,
            _ => return None,
        })
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Property => "property",
            Self::Entry => "entry",
            Self::Element => "element",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown value tag {0:#04x}")]
    UnknownTag(i64),
    #[error("unknown object member tag {0:#04x}")]
    UnknownMemberTag(i64),
    #[error("composite value must start with an integer tag, found {0}")]
    MissingTag(&'static str),
    #[error("{tag} expects {expected} payload elements, found {found}")]
    Arity {
        tag: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("unexpected map outside a tagged composite")]
    UntaggedMap,
    #[error("object member property keys must be strings, found {0}")]
    PropertyKey(&'static str),
    #[error("object member element indices must be integers, found {0}")]
    ElementIndex(&'static str),
    #[error("unexpected {member} member in non-Dynamic object {class}")]
    UnexpectedMember { class: String, member: &'static str },
    #[error("expected {expected} in {context}, found {found}")]
    Type {
        context: &'static str,
        expected: &'static str,
        found: &'static str,
    },
    #[error("unknown {kind} unit {unit:?}")]
    UnknownUnit { kind: &'static str, unit: String },
    #[error("unknown message code {0:#04x}")]
    UnknownMessageCode(u8),
    #[error("malformed MessagePack: {0}")]
    MsgPack(#[from] rmp_serde::decode::Error),
    #[error("failed to re-encode MessagePack: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

/// Decode MessagePack bytes holding one Pkl value.
pub fn decode_slice(bytes: &[u8]) -> Result<Value, DecodeError> {
    let raw: RawValue = rmp_serde::from_slice(bytes)?;
    decode(&raw)
}

pub fn decode(raw: &RawValue) -> Result<Value, DecodeError> {
    match raw {
        RawValue::Nil => Ok(Value::Null),
        RawValue::Bool(b) => Ok(Value::Bool(*b)),
        RawValue::Int(i) => Ok(Value::Int(*i)),
        RawValue::Float(f) => Ok(Value::Float(*f)),
        RawValue::String(s) => Ok(Value::String(s.clone())),
        RawValue::Binary(b) => Ok(Value::Bytes(b.clone())),
        RawValue::Array(items) => decode_composite(items),
        RawValue::Map(_) => Err(DecodeError::UntaggedMap),
    }
}

fn decode_composite(items: &[RawValue]) -> Result<Value, DecodeError> {
    let (head, payload) = items
        .split_first()
        .ok_or(DecodeError::MissingTag("empty array"))?;
    let code = head.as_i64().ok_or(DecodeError::MissingTag(head.kind()))?;
    let tag = Tag::from_i64(code).ok_or(DecodeError::UnknownTag(code))?;

    if let Some(expected) = tag.arity()
        && payload.len() != expected
    {
        return Err(DecodeError::Arity {
            tag: tag.name(),
            expected,
            found: payload.len(),
        });
    }

    match tag {
        Tag::Object => {
            let name = expect_str(&payload[0], "object class name")?;
            let module_uri = expect_str(&payload[1], "object module uri")?;
            let members = expect_array(&payload[2], "object members")?;
            if name == DYNAMIC_CLASS && module_uri == DYNAMIC_MODULE {
                decode_dynamic(members).map(Value::Dynamic)
            } else {
                decode_typed(name, module_uri, members).map(Value::Object)
            }
        }
        Tag::Map | Tag::Mapping => {
            let RawValue::Map(entries) = &payload[0] else {
                return Err(type_error(tag.name(), "map", &payload[0]));
            };
            let entries = entries
                .iter()
                .map(|(k, v)| -> Result<(Value, Value), DecodeError> {
                    Ok((decode(k)?, decode(v)?))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Map(entries))
        }
        Tag::List | Tag::Listing => decode_items(&payload[0], tag.name()).map(Value::List),
        Tag::Set => {
            let mut unique: Vec<Value> = Vec::new();
            for item in decode_items(&payload[0], tag.name())? {
                if !unique.contains(&item) {
                    unique.push(item);
                }
            }
            Ok(Value::Set(unique))
        }
        Tag::Duration => {
            let value = expect_number(&payload[0], "duration value")?;
            let unit = expect_str(&payload[1], "duration unit")?;
            let unit = DurationUnit::parse(unit).ok_or_else(|| DecodeError::UnknownUnit {
                kind: "duration",
                unit: unit.to_string(),
            })?;
            Ok(Value::Duration(Duration { value, unit }))
        }
        Tag::DataSize => {
            let value = expect_number(&payload[0], "data size value")?;
            let unit = expect_str(&payload[1], "data size unit")?;
            let unit = DataSizeUnit::parse(unit).ok_or_else(|| DecodeError::UnknownUnit {
                kind: "data size",
                unit: unit.to_string(),
            })?;
            Ok(Value::DataSize(DataSize { value, unit }))
        }
        Tag::Pair => Ok(Value::Pair(
            Box::new(decode(&payload[0])?),
            Box::new(decode(&payload[1])?),
        )),
        Tag::IntSeq => Ok(Value::IntSeq(IntSeq {
            start: expect_int(&payload[0], "int seq start")?,
            end: expect_int(&payload[1], "int seq end")?,
            step: expect_int(&payload[2], "int seq step")?,
        })),
        Tag::Regex => Ok(Value::Regex(Regex {
            pattern: expect_str(&payload[0], "regex pattern")?.to_string(),
        })),
        Tag::Class => Ok(Value::Class),
        Tag::TypeAlias => Ok(Value::TypeAlias),
    }
}

/// One `[memberTag, keyOrNameOrIndex, value]` triple.
fn split_member(member: &RawValue) -> Result<(MemberTag, &RawValue, &RawValue), DecodeError> {
    let parts = expect_array(member, "object member")?;
    let (head, payload) = parts
        .split_first()
        .ok_or(DecodeError::MissingTag("empty array"))?;
    let code = head.as_i64().ok_or(DecodeError::MissingTag(head.kind()))?;
    let tag = MemberTag::from_i64(code).ok_or(DecodeError::UnknownMemberTag(code))?;
    let [key, value] = payload else {
        return Err(DecodeError::Arity {
            tag: tag.name(),
            expected: 2,
            found: payload.len(),
        });
    };
    Ok((tag, key, value))
}

fn decode_typed(
    name: &str,
    module_uri: &str,
    members: &[RawValue],
) -> Result<TypedObject, DecodeError> {
    let mut properties = IndexMap::with_capacity(members.len());
    for member in members {
        let (tag, key, value) = split_member(member)?;
        match tag {
            MemberTag::Property => {
                let key = key.as_str().ok_or(DecodeError::PropertyKey(key.kind()))?;
                properties.insert(key.to_string(), decode(value)?);
            }
            MemberTag::Entry | MemberTag::Element => {
                return Err(DecodeError::UnexpectedMember {
                    class: name.to_string(),
                    member: tag.name(),
                });
            }
        }
    }
    Ok(TypedObject {
        name: name.to_string(),
        module_uri: module_uri.to_string(),
        properties,
    })
}

fn decode_dynamic(members: &[RawValue]) -> Result<DynamicObject, DecodeError> {
    let mut object = DynamicObject::default();
    for member in members {
        let (tag, key, value) = split_member(member)?;
        match tag {
            MemberTag::Property => {
                let key = key.as_str().ok_or(DecodeError::PropertyKey(key.kind()))?;
                object.properties.insert(key.to_string(), decode(value)?);
            }
            MemberTag::Entry => {
                object.entries.push((decode(key)?, decode(value)?));
            }
            MemberTag::Element => {
                if key.as_i64().is_none() {
                    return Err(DecodeError::ElementIndex(key.kind()));
                }
                object.elements.push(decode(value)?);
            }
        }
    }
    Ok(object)
}

fn decode_items(raw: &RawValue, context: &'static str) -> Result<Vec<Value>, DecodeError> {
    expect_array(raw, context)?.iter().map(decode).collect()
}

fn type_error(context: &'static str, expected: &'static str, found: &RawValue) -> DecodeError {
    DecodeError::Type {
        context,
        expected,
        found: found.kind(),
    }
}

fn expect_str<'a>(raw: &'a RawValue, context: &'static str) -> Result<&'a str, DecodeError> {
    raw.as_str().ok_or_else(|| type_error(context, "string", raw))
}

fn expect_int(raw: &RawValue, context: &'static str) -> Result<i64, DecodeError> {
    raw.as_i64().ok_or_else(|| type_error(context, "integer", raw))
}

fn expect_number(raw: &RawValue, context: &'static str) -> Result<f64, DecodeError> {
    match raw {
        RawValue::Float(f) => Ok(*f),
        RawValue::Int(i) => Ok(*i as f64),
        other => Err(type_error(context, "number", other)),
    }
}

fn expect_array<'a>(
    raw: &'a RawValue,
    context: &'static str,
) -> Result<&'a [RawValue], DecodeError> {
    match raw {
        RawValue::Array(items) => Ok(items),
        other => Err(type_error(context, "array", other)),
    }
}

fn tagged(tag: Tag, payload: impl IntoIterator<Item = RawValue>) -> RawValue {
    let mut items = vec![RawValue::Int(tag as i64)];
    items.extend(payload);
    RawValue::Array(items)
}

fn member(tag: MemberTag, key: RawValue, value: &Value) -> RawValue {
    RawValue::Array(vec![RawValue::Int(tag as i64), key, encode(value)])
}

/// Encode a value into the tagged wire shape. Maps use the `Map` tag and
/// lists the `List` tag.
pub fn encode(value: &Value) -> RawValue {
    match value {
        Value::Null => RawValue::Nil,
        Value::Bool(b) => RawValue::Bool(*b),
        Value::Int(i) => RawValue::Int(*i),
        Value::Float(f) => RawValue::Float(*f),
        Value::String(s) => RawValue::String(s.clone()),
        Value::Bytes(b) => RawValue::Binary(b.clone()),
        Value::Object(obj) => {
            let members = obj
                .properties
                .iter()
                .map(|(k, v)| member(MemberTag::Property, RawValue::from(k.as_str()), v))
                .collect();
            tagged(
                Tag::Object,
                [
                    RawValue::from(obj.name.as_str()),
                    RawValue::from(obj.module_uri.as_str()),
                    RawValue::Array(members),
                ],
            )
        }
        Value::Dynamic(obj) => {
            let properties = obj
                .properties
                .iter()
                .map(|(k, v)| member(MemberTag::Property, RawValue::from(k.as_str()), v));
            let entries = obj
                .entries
                .iter()
                .map(|(k, v)| member(MemberTag::Entry, encode(k), v));
            let elements = obj
                .elements
                .iter()
                .enumerate()
                .map(|(i, v)| member(MemberTag::Element, RawValue::Int(i as i64), v));
            tagged(
                Tag::Object,
                [
                    RawValue::from(DYNAMIC_CLASS),
                    RawValue::from(DYNAMIC_MODULE),
                    RawValue::Array(properties.chain(entries).chain(elements).collect()),
                ],
            )
        }
        Value::Map(entries) => tagged(
            Tag::Map,
            [RawValue::Map(
                entries.iter().map(|(k, v)| (encode(k), encode(v))).collect(),
            )],
        ),
        Value::List(items) => tagged(Tag::List, [RawValue::Array(items.iter().map(encode).collect())]),
        Value::Set(items) => tagged(Tag::Set, [RawValue::Array(items.iter().map(encode).collect())]),
        Value::Duration(d) => tagged(
            Tag::Duration,
            [RawValue::Float(d.value), RawValue::from(d.unit.as_str())],
        ),
        Value::DataSize(d) => tagged(
            Tag::DataSize,
            [RawValue::Float(d.value), RawValue::from(d.unit.as_str())],
        ),
        Value::Pair(first, second) => tagged(Tag::Pair, [encode(first), encode(second)]),
        Value::IntSeq(seq) => tagged(
            Tag::IntSeq,
            [
                RawValue::Int(seq.start),
                RawValue::Int(seq.end),
                RawValue::Int(seq.step),
            ],
        ),
        Value::Regex(re) => tagged(Tag::Regex, [RawValue::from(re.pattern.as_str())]),
        Value::Class => tagged(Tag::Class, []),
        Value::TypeAlias => tagged(Tag::TypeAlias, []),
    }
}

/// Encode a value to MessagePack bytes.
pub fn encode_to_vec(value: &Value) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec(&encode(value))
}
