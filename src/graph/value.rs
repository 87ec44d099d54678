//! Attribute value model.
//!
//! Declared attribute values are parsed once into a tagged union that keeps
//! literals apart from references to other resources' attributes, so later
//! stages never have to sniff strings for `${...}` again.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::config::is_valid_identifier;
use crate::error::BuildError;

/// Resolved attribute mapping as sent to and received from providers.
pub type Attributes = BTreeMap<String, Value>;

/// A reference to another resource's attribute: `${kind.name.attribute}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Reference {
    /// Address of the referenced resource (`kind.name`).
    pub address: String,
    /// Attribute read from that resource. `id` is the provider identifier.
    pub attribute: String,
}

/// Piece of an interpolated string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text.
    Text(String),
    /// Embedded reference.
    Ref(Reference),
}

/// A declared attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    /// A value with no references.
    Literal(Value),
    /// A string that is exactly one reference; resolves to the referenced
    /// value with its original JSON type.
    Reference(Reference),
    /// A string mixing text and references; resolves to a string.
    Interpolated(Vec<Segment>),
    /// A list containing at least one reference.
    List(Vec<AttributeValue>),
    /// A map containing at least one reference.
    Map(BTreeMap<String, AttributeValue>),
}

impl Reference {
    /// Parses the inside of a `${...}` expression.
    ///
    /// Returns `None` unless the expression has the form
    /// `kind.name.attribute` with valid identifiers. The attribute part may
    /// itself contain dots.
    #[must_use]
    pub fn parse(expression: &str) -> Option<Self> {
        let mut parts = expression.trim().splitn(3, '.');
        let kind = parts.next()?;
        let name = parts.next()?;
        let attribute = parts.next()?;

        if !is_valid_identifier(kind) || !is_valid_identifier(name) || attribute.is_empty() {
            return None;
        }

        Some(Self {
            address: format!("{kind}.{name}"),
            attribute: attribute.to_string(),
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.address, self.attribute)
    }
}

impl AttributeValue {
    /// Parses a declared JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::InvalidReference`] for an unterminated or
    /// malformed `${...}` expression.
    pub fn parse(value: &Value, location: &str) -> Result<Self, BuildError> {
        match value {
            Value::String(s) => Self::parse_string(s, location),
            Value::Array(items) => {
                let parsed = items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| Self::parse(item, &format!("{location}[{i}]")))
                    .collect::<Result<Vec<_>, _>>()?;
                if parsed.iter().all(Self::is_literal) {
                    Ok(Self::Literal(value.clone()))
                } else {
                    Ok(Self::List(parsed))
                }
            }
            Value::Object(entries) => {
                let parsed = entries
                    .iter()
                    .map(|(key, item)| {
                        Self::parse(item, &format!("{location}.{key}")).map(|v| (key.clone(), v))
                    })
                    .collect::<Result<BTreeMap<_, _>, _>>()?;
                if parsed.values().all(Self::is_literal) {
                    Ok(Self::Literal(value.clone()))
                } else {
                    Ok(Self::Map(parsed))
                }
            }
            _ => Ok(Self::Literal(value.clone())),
        }
    }

    /// Parses a string, splitting out `${...}` references. `$${` escapes a
    /// literal `${`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::InvalidReference`] for a malformed expression.
    pub fn parse_string(input: &str, location: &str) -> Result<Self, BuildError> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut rest = input;

        while let Some(start) = rest.find('$') {
            text.push_str(&rest[..start]);
            let tail = &rest[start..];

            if tail.starts_with("$${") {
                text.push_str("${");
                rest = &tail[3..];
            } else if let Some(body) = tail.strip_prefix("${") {
                let end = body.find('}').ok_or_else(|| BuildError::InvalidReference {
                    location: location.to_string(),
                    expression: tail.to_string(),
                })?;
                let expression = &body[..end];
                let reference =
                    Reference::parse(expression).ok_or_else(|| BuildError::InvalidReference {
                        location: location.to_string(),
                        expression: format!("${{{expression}}}"),
                    })?;
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                segments.push(Segment::Ref(reference));
                rest = &body[end + 1..];
            } else {
                text.push('$');
                rest = &tail[1..];
            }
        }
        text.push_str(rest);

        if segments.is_empty() {
            return Ok(Self::Literal(Value::String(text)));
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        if let [Segment::Ref(reference)] = segments.as_slice() {
            return Ok(Self::Reference(reference.clone()));
        }
        Ok(Self::Interpolated(segments))
    }

    /// Returns true if the value holds no references.
    #[must_use]
    pub const fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    /// Collects every reference contained in the value.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut found = Vec::new();
        self.collect_references(&mut found);
        found
    }

    fn collect_references<'a>(&'a self, found: &mut Vec<&'a Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(reference) => found.push(reference),
            Self::Interpolated(segments) => {
                for segment in segments {
                    if let Segment::Ref(reference) = segment {
                        found.push(reference);
                    }
                }
            }
            Self::List(items) => {
                for item in items {
                    item.collect_references(found);
                }
            }
            Self::Map(entries) => {
                for item in entries.values() {
                    item.collect_references(found);
                }
            }
        }
    }

    /// Resolves the value, asking `lookup` for each reference.
    ///
    /// `lookup` returns `Ok(None)` when the referenced value is not known
    /// yet; the whole value is then unknown and `Ok(None)` is returned.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by `lookup`.
    pub fn resolve<E, F>(&self, lookup: &mut F) -> Result<Option<Value>, E>
    where
        F: FnMut(&Reference) -> Result<Option<Value>, E>,
    {
        match self {
            Self::Literal(value) => Ok(Some(value.clone())),
            Self::Reference(reference) => lookup(reference),
            Self::Interpolated(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(text) => out.push_str(text),
                        Segment::Ref(reference) => match lookup(reference)? {
                            Some(Value::String(s)) => out.push_str(&s),
                            Some(other) => out.push_str(&other.to_string()),
                            None => return Ok(None),
                        },
                    }
                }
                Ok(Some(Value::String(out)))
            }
            Self::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item.resolve(lookup)? {
                        Some(value) => out.push(value),
                        None => return Ok(None),
                    }
                }
                Ok(Some(Value::Array(out)))
            }
            Self::Map(entries) => {
                let mut out = serde_json::Map::new();
                for (key, item) in entries {
                    match item.resolve(lookup)? {
                        Some(value) => {
                            out.insert(key.clone(), value);
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some(Value::Object(out)))
            }
        }
    }
}

/// Reads an attribute from a resolved attribute map, following dotted paths
/// into nested objects when there is no exact key.
#[must_use]
pub fn lookup_attribute(attributes: &Attributes, path: &str) -> Option<Value> {
    if let Some(value) = attributes.get(path) {
        return Some(value.clone());
    }

    let mut parts = path.split('.');
    let mut current = attributes.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}
