//! A loose, attribute-preserving XML tree.
//!
//! Aggregate reports are produced by many different mail providers, and they
//! don't agree on much beyond element names. Instead of mapping the document
//! onto a fixed type hierarchy, it is read into a [`serde_json::Value`]:
//!
//! - an element with only text becomes a string
//! - an element with children or attributes becomes an object, keyed by child
//!   name, with attributes stored as `@_name` and mixed text as `#text`
//! - a child name that repeats becomes an array
//!
//! Whether a given child is a scalar or an array therefore depends on the
//! sender, so callers read repeated elements through [`to_sequence`].

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};

use crate::error::ParseError;

/// Key under which mixed text content is stored on an object node.
pub const TEXT_KEY: &str = "#text";

/// Prefix applied to attribute names on an object node.
pub const ATTRIBUTE_PREFIX: &str = "@_";

struct Frame {
	name: String,
	children: Map<String, Value>,
	text: String,
}

impl Frame {
	fn open(start: &BytesStart) -> Frame {
		let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
		let mut children = Map::new();

		for attribute in start.attributes().flatten() {
			let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
			let value = match attribute.unescape_value() {
				Ok(value) => value.into_owned(),
				Err(_) => String::from_utf8_lossy(&attribute.value).into_owned(),
			};
			children.insert(format!("{}{}", ATTRIBUTE_PREFIX, key), Value::String(value));
		}

		Frame {
			name,
			children,
			text: String::new(),
		}
	}

	fn close(self) -> (String, Value) {
		if self.children.is_empty() {
			return (self.name, Value::String(self.text));
		}

		let mut children = self.children;
		if !self.text.is_empty() {
			children.insert(TEXT_KEY.to_string(), Value::String(self.text));
		}
		(self.name, Value::Object(children))
	}
}

fn attach(parent: &mut Map<String, Value>, name: String, value: Value) {
	match parent.get_mut(&name) {
		Some(Value::Array(existing)) => existing.push(value),
		Some(existing) => {
			let first = existing.take();
			*existing = Value::Array(vec![first, value]);
		}
		None => {
			parent.insert(name, value);
		}
	}
}

/// Reads an XML document into a generic tree.
///
/// The returned map holds the document's top-level elements. A well-formed
/// document has exactly one, but fragments with several top-level elements are
/// accepted as well.
pub fn parse_document(xml: &str) -> Result<Map<String, Value>, ParseError> {
	let mut reader = Reader::from_str(xml);
	reader.config_mut().trim_text(true);

	let mut root = Map::new();
	let mut stack: Vec<Frame> = Vec::new();

	loop {
		match reader.read_event() {
			Ok(Event::Start(ref e)) => stack.push(Frame::open(e)),
			Ok(Event::Empty(ref e)) => {
				let (name, value) = Frame::open(e).close();
				match stack.last_mut() {
					Some(parent) => attach(&mut parent.children, name, value),
					None => attach(&mut root, name, value),
				}
			}
			Ok(Event::End(_)) => {
				let frame = match stack.pop() {
					Some(frame) => frame,
					None => return Err(ParseError::Xml("unbalanced closing tag".to_string())),
				};
				let (name, value) = frame.close();
				match stack.last_mut() {
					Some(parent) => attach(&mut parent.children, name, value),
					None => attach(&mut root, name, value),
				}
			}
			Ok(Event::Text(ref e)) => {
				// text outside of any element is ignored
				if let Some(frame) = stack.last_mut() {
					match e.unescape() {
						Ok(text) => frame.text.push_str(&text),
						Err(_) => frame.text.push_str(&String::from_utf8_lossy(e)),
					}
				}
			}
			Ok(Event::CData(ref e)) => {
				if let Some(frame) = stack.last_mut() {
					frame.text.push_str(&String::from_utf8_lossy(e));
				}
			}
			Ok(Event::Eof) => break,
			Ok(Event::Decl(_))
			| Ok(Event::Comment(_))
			| Ok(Event::PI(_))
			| Ok(Event::DocType(_)) => {}
			Err(e) => return Err(ParseError::Xml(e.to_string())),
		}
	}

	if let Some(frame) = stack.last() {
		return Err(ParseError::Xml(format!("element <{}> is never closed", frame.name)));
	}

	Ok(root)
}

/// Normalizes a node that may be absent, a single value or an array.
///
/// Absent (or `null`) yields nothing, an array yields its items, and anything
/// else yields itself.
pub fn to_sequence(value: Option<&Value>) -> Vec<&Value> {
	match value {
		None | Some(Value::Null) => Vec::new(),
		Some(Value::Array(items)) => items.iter().collect(),
		Some(other) => vec![other],
	}
}

/// The first occurrence of a node that may have been repeated.
pub fn first(value: Option<&Value>) -> Option<&Value> {
	to_sequence(value).into_iter().next()
}

/// Text content of a node, whether it was read as a plain string or as an
/// object carrying attributes.
pub fn text(value: Option<&Value>) -> Option<&str> {
	match first(value)? {
		Value::String(s) => Some(s.as_str()),
		Value::Object(map) => map.get(TEXT_KEY).and_then(Value::as_str),
		_ => None,
	}
}
