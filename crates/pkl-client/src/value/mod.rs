//! Native representation of Pkl values and the tagged wire codec.
//!
//! - **raw**: untyped MessagePack values (`RawValue`)
//! - **decode**: tag table, `decode`/`encode` between `RawValue` and `Value`

mod decode;
mod raw;

use indexmap::IndexMap;

pub use decode::{
    DecodeError, MemberTag, Tag, decode, decode_slice, encode, encode_to_vec,
};
pub use raw::RawValue;

/// A decoded Pkl value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Instance of a Pkl class other than `pkl.base#Dynamic`.
    Object(TypedObject),
    Dynamic(DynamicObject),
    /// `Map` and `Mapping`. Keys may be any value.
    Map(Vec<(Value, Value)>),
    /// `List` and `Listing`.
    List(Vec<Value>),
    Set(Vec<Value>),
    Duration(Duration),
    DataSize(DataSize),
    Pair(Box<Value>, Box<Value>),
    IntSeq(IntSeq),
    Regex(Regex),
    Class,
    TypeAlias,
}

impl Value {
    /// Look up an object property, or a map entry with a string key.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Self::Object(obj) => obj.properties.get(name),
            Self::Dynamic(obj) => obj.properties.get(name),
            Self::Map(entries) => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(name))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Items of a list, set, or the elements of a dynamic object.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) | Self::Set(items) => Some(items),
            Self::Dynamic(obj) => Some(&obj.elements),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypedObject {
    /// Qualified class name, e.g. `Person`.
    pub name: String,
    /// URI of the module that declares the class.
    pub module_uri: String,
    pub properties: IndexMap<String, Value>,
}

/// A `pkl.base#Dynamic` object, split into its three member kinds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicObject {
    pub properties: IndexMap<String, Value>,
    pub entries: Vec<(Value, Value)>,
    /// In the order received; element indices are not used for ordering.
    pub elements: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl DurationUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nanoseconds => "ns",
            Self::Microseconds => "us",
            Self::Milliseconds => "ms",
            Self::Seconds => "s",
            Self::Minutes => "min",
            Self::Hours => "h",
            Self::Days => "d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "ns" => Self::Nanoseconds,
            "us" => Self::Microseconds,
            "ms" => Self::Milliseconds,
            "s" => Self::Seconds,
            "min" => Self::Minutes,
            "h" => Self::Hours,
            "d" => Self::Days,
            _ => return None,
        })
    }

    fn nanos(&self) -> f64 {
        match self {
            Self::Nanoseconds => 1.0,
            Self::Microseconds => 1e3,
            Self::Milliseconds => 1e6,
            Self::Seconds => 1e9,
            Self::Minutes => 60.0 * 1e9,
            Self::Hours => 3600.0 * 1e9,
            Self::Days => 86400.0 * 1e9,
        }
    }
}

/// `pkl.base#Duration`, e.g. `30.5.s`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Duration {
    pub value: f64,
    pub unit: DurationUnit,
}

impl Duration {
    /// Convert to a std duration. `None` for negative or non-finite values.
    pub fn to_std(&self) -> Option<std::time::Duration> {
        let secs = self.value * self.unit.nanos() / 1e9;
        std::time::Duration::try_from_secs_f64(secs).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSizeUnit {
    Bytes,
    Kilobytes,
    Kibibytes,
    Megabytes,
    Mebibytes,
    Gigabytes,
    Gibibytes,
    Terabytes,
    Tebibytes,
    Petabytes,
    Pebibytes,
}

impl DataSizeUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bytes => "b",
            Self::Kilobytes => "kb",
            Self::Kibibytes => "kib",
            Self::Megabytes => "mb",
            Self::Mebibytes => "mib",
            Self::Gigabytes => "gb",
            Self::Gibibytes => "gib",
            Self::Terabytes => "tb",
            Self::Tebibytes => "tib",
            Self::Petabytes => "pb",
            Self::Pebibytes => "pib",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "b" => Self::Bytes,
            "kb" => Self::Kilobytes,
            "kib" => Self::Kibibytes,
            "mb" => Self::Megabytes,
            "mib" => Self::Mebibytes,
            "gb" => Self::Gigabytes,
            "gib" => Self::Gibibytes,
            "tb" => Self::Terabytes,
            "tib" => Self::Tebibytes,
            "pb" => Self::Petabytes,
            "pib" => Self::Pebibytes,
            _ => return None,
        })
    }
}

/// `pkl.base#DataSize`, e.g. `30.5.mb`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataSize {
    pub value: f64,
    pub unit: DataSizeUnit,
}

/// `pkl.base#IntSeq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntSeq {
    pub start: i64,
    pub end: i64,
    pub step: i64,
}

/// `pkl.base#Regex`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Regex {
    pub pattern: String,
}
