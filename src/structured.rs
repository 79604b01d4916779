//! Typed value trees for the structured fallback channel. Messages that support it render
//!  themselves into a [StructuredValue] in addition to their binary body; the tree is then
//!  delivered through a circuit's [crate::event_queue::EventQueue] instead of a UDP datagram.
//!
//! Trees serialize to the XML form the side channel speaks:
//!
//! ```ascii
//! <llsd><map><key>AgentData</key><array><map>...</map></array></map></llsd>
//! ```

use std::fmt::Write;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq)]
pub enum StructuredValue {
    Undefined,
    Boolean(bool),
    Integer(i32),
    Real(f64),
    String(String),
    Uuid(Uuid),
    Binary(Vec<u8>),
    /// keys keep insertion order, which is the order the binary form declares its fields in
    Map(Vec<(String, StructuredValue)>),
    Array(Vec<StructuredValue>),
}

impl StructuredValue {
    pub fn map() -> MapBuilder {
        MapBuilder { entries: Vec::new() }
    }

    pub fn get(&self, key: &str) -> Option<&StructuredValue> {
        match self {
            StructuredValue::Map(entries) => entries.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[StructuredValue]> {
        match self {
            StructuredValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Unsigned 32-bit fields have no native representation, they travel as the four raw bytes
    ///  in network byte order
    pub fn from_u32(value: u32) -> StructuredValue {
        StructuredValue::Binary(value.to_be_bytes().to_vec())
    }

    pub fn to_xml(&self) -> String {
        let mut result = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?><llsd>");
        self.write_xml(&mut result);
        result.push_str("</llsd>");
        result
    }

    fn write_xml(&self, out: &mut String) {
        // writing to a String cannot fail
        let _ = match self {
            StructuredValue::Undefined => write!(out, "<undef />"),
            StructuredValue::Boolean(b) => write!(out, "<boolean>{}</boolean>", if *b { 1 } else { 0 }),
            StructuredValue::Integer(i) => write!(out, "<integer>{}</integer>", i),
            StructuredValue::Real(r) => write!(out, "<real>{}</real>", r),
            StructuredValue::String(s) => write!(out, "<string>{}</string>", escape_xml(s)),
            StructuredValue::Uuid(u) => write!(out, "<uuid>{}</uuid>", u.hyphenated()),
            StructuredValue::Binary(b) => write!(out, "<binary encoding=\"base64\">{}</binary>", STANDARD.encode(b)),
            StructuredValue::Map(entries) => {
                out.push_str("<map>");
                for (key, value) in entries {
                    let _ = write!(out, "<key>{}</key>", escape_xml(key));
                    value.write_xml(out);
                }
                out.push_str("</map>");
                Ok(())
            }
            StructuredValue::Array(items) => {
                out.push_str("<array>");
                for item in items {
                    item.write_xml(out);
                }
                out.push_str("</array>");
                Ok(())
            }
        };
    }
}

fn escape_xml(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '&' => result.push_str("&amp;"),
            '"' => result.push_str("&quot;"),
            '\'' => result.push_str("&apos;"),
            c => result.push(c),
        }
    }
    result
}

pub struct MapBuilder {
    entries: Vec<(String, StructuredValue)>,
}

impl MapBuilder {
    pub fn with(mut self, key: &str, value: StructuredValue) -> MapBuilder {
        self.entries.push((key.to_string(), value));
        self
    }

    pub fn build(self) -> StructuredValue {
        StructuredValue::Map(self.entries)
    }
}

impl From<bool> for StructuredValue {
    fn from(value: bool) -> Self {
        StructuredValue::Boolean(value)
    }
}
impl From<i32> for StructuredValue {
    fn from(value: i32) -> Self {
        StructuredValue::Integer(value)
    }
}
impl From<u8> for StructuredValue {
    fn from(value: u8) -> Self {
        StructuredValue::Integer(value as i32)
    }
}
impl From<u16> for StructuredValue {
    fn from(value: u16) -> Self {
        StructuredValue::Integer(value as i32)
    }
}
impl From<f32> for StructuredValue {
    fn from(value: f32) -> Self {
        StructuredValue::Real(value as f64)
    }
}
impl From<&str> for StructuredValue {
    fn from(value: &str) -> Self {
        StructuredValue::String(value.to_string())
    }
}
impl From<Uuid> for StructuredValue {
    fn from(value: Uuid) -> Self {
        StructuredValue::Uuid(value)
    }
}
impl From<[f32; 3]> for StructuredValue {
    fn from(value: [f32; 3]) -> Self {
        StructuredValue::Array(value.iter().map(|&v| v.into()).collect())
    }
}

/// A message type that can be delivered over the structured fallback channel. The tree carries
///  the same content as the binary body.
pub trait StructuredMessage {
    /// The event name the side channel uses for this message, usually the message type's name
    fn event_name(&self) -> &'static str;

    fn to_structured(&self) -> StructuredValue;
}
