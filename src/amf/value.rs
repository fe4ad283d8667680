//! AMF value representation
//!
//! A single tagged sum covers every AMF0 type the command layer and
//! onMetaData handling need. Keys in objects are always strings.

use std::collections::HashMap;

/// A decoded AMF0 value
#[derive(Debug, Clone, PartialEq)]
pub enum AmfValue {
    /// Null (0x05)
    Null,

    /// Undefined (0x06)
    Undefined,

    /// Boolean (0x01)
    Boolean(bool),

    /// IEEE 754 double (0x00); also carries transaction ids and stream ids
    Number(f64),

    /// UTF-8 string (0x02 short / 0x0C long)
    String(String),

    /// Anonymous object (0x03)
    Object(HashMap<String, AmfValue>),

    /// ECMA array (0x08), associative; used by onMetaData
    EcmaArray(HashMap<String, AmfValue>),

    /// Strict array (0x0A), dense
    Array(Vec<AmfValue>),

    /// Typed object (0x10): class name + properties
    TypedObject {
        class_name: String,
        properties: HashMap<String, AmfValue>,
    },

    /// Date (0x0B) as milliseconds since the Unix epoch
    Date(f64),

    /// XML document (0x0F)
    Xml(String),
}

impl AmfValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmfValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmfValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Object-like view: anonymous objects, ECMA arrays and typed objects
    /// all expose their properties.
    pub fn as_object(&self) -> Option<&HashMap<String, AmfValue>> {
        match self {
            AmfValue::Object(m) => Some(m),
            AmfValue::EcmaArray(m) => Some(m),
            AmfValue::TypedObject { properties, .. } => Some(properties),
            _ => None,
        }
    }

    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, AmfValue::Null | AmfValue::Undefined)
    }

    /// Property lookup on an object-like value
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.as_object()?.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_number()
    }

    /// Build an object from key/value pairs; convenience for command replies
    pub fn object<K: Into<String>, I: IntoIterator<Item = (K, AmfValue)>>(pairs: I) -> Self {
        AmfValue::Object(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl Default for AmfValue {
    fn default() -> Self {
        AmfValue::Null
    }
}

impl From<bool> for AmfValue {
    fn from(v: bool) -> Self {
        AmfValue::Boolean(v)
    }
}

impl From<f64> for AmfValue {
    fn from(v: f64) -> Self {
        AmfValue::Number(v)
    }
}

impl From<&str> for AmfValue {
    fn from(v: &str) -> Self {
        AmfValue::String(v.to_string())
    }
}

impl From<String> for AmfValue {
    fn from(v: String) -> Self {
        AmfValue::String(v)
    }
}
