//! # Protocol Message Values
//!
//! A [`Unit`] is one application-level message value as it travels between a
//! connection and application code. Units come in three shapes:
//!
//! - **Scalar**: a null marker, an unsigned 32-bit integer, or an arbitrary
//!   byte string
//! - **Composite**: an ordered sequence of nested units, used by codecs to
//!   bundle a framing header together with its payload so the wire form can
//!   be produced by flattening
//! - **Error**: a failure marker carrying a human-readable message
//!
//! Accessing a unit through the wrong accessor is a programming error and
//! panics; code that wants to branch on shape uses the `is_*` predicates.

use std::borrow::Cow;
use std::fmt;

use crate::framing::encode_varint;

/// The integer payload type carried by integer units.
pub type Integer = u32;

/// Scalar payload of a [`Unit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scalar {
    /// Carries no payload; only marks success.
    Null,
    /// Unsigned 32-bit value, serialized as a varint.
    Integer(Integer),
    /// Arbitrary byte sequence, serialized as-is.
    Bytes(Vec<u8>),
}

/// One application-level message value, possibly composite.
///
/// Equality compares shape, payload, and nested children in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    Scalar(Scalar),
    Composite(Vec<Unit>),
    Error(String),
}

impl Unit {
    /// A successful unit with no payload.
    pub fn null() -> Self {
        Unit::Scalar(Scalar::Null)
    }

    /// An integer unit.
    pub fn integer(value: Integer) -> Self {
        Unit::Scalar(Scalar::Integer(value))
    }

    /// A byte-string unit.
    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        Unit::Scalar(Scalar::Bytes(value.into()))
    }

    /// A composite unit holding `children` in order.
    pub fn composite(children: Vec<Unit>) -> Self {
        Unit::Composite(children)
    }

    /// A failed unit carrying an error message.
    pub fn error(message: impl Into<String>) -> Self {
        Unit::Error(message.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Unit::Scalar(Scalar::Null))
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Unit::Scalar(Scalar::Integer(_)))
    }

    pub fn is_bytes(&self) -> bool {
        matches!(self, Unit::Scalar(Scalar::Bytes(_)))
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Unit::Composite(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Unit::Error(_))
    }

    /// Whether this unit represents success. False exactly for errors.
    pub fn ok(&self) -> bool {
        !self.is_error()
    }

    /// The integer payload.
    ///
    /// # Panics
    ///
    /// Panics if the unit is not an integer scalar.
    pub fn as_integer(&self) -> Integer {
        match self {
            Unit::Scalar(Scalar::Integer(v)) => *v,
            other => panic!("unit is not an integer: {other}"),
        }
    }

    /// The byte payload.
    ///
    /// # Panics
    ///
    /// Panics if the unit is not a byte-string scalar.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Unit::Scalar(Scalar::Bytes(b)) => b,
            other => panic!("unit is not a byte string: {other}"),
        }
    }

    /// The byte payload rendered as text (lossily for non-UTF-8 data).
    ///
    /// # Panics
    ///
    /// Panics if the unit is not a byte-string scalar.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }

    /// The nested children of a composite unit.
    ///
    /// # Panics
    ///
    /// Panics if the unit is not composite.
    pub fn children(&self) -> &[Unit] {
        match self {
            Unit::Composite(children) => children,
            other => panic!("unit is not composite: {other}"),
        }
    }

    /// The error message.
    ///
    /// # Panics
    ///
    /// Panics if the unit is not an error.
    pub fn error_message(&self) -> &str {
        match self {
            Unit::Error(msg) => msg,
            other => panic!("unit is not an error: {other}"),
        }
    }

    /// Flattens this unit into its wire form.
    ///
    /// Null units contribute nothing, integers their varint encoding, byte
    /// strings their raw bytes, and composites the concatenation of their
    /// serialized children. Error messages serialize as their raw bytes.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_wire_bytes(&mut out);
        out
    }

    fn write_wire_bytes(&self, out: &mut Vec<u8>) {
        match self {
            Unit::Scalar(Scalar::Null) => {}
            Unit::Scalar(Scalar::Integer(v)) => out.extend_from_slice(&encode_varint(*v)),
            Unit::Scalar(Scalar::Bytes(b)) => out.extend_from_slice(b),
            Unit::Composite(children) => {
                for child in children {
                    child.write_wire_bytes(out);
                }
            }
            Unit::Error(msg) => out.extend_from_slice(msg.as_bytes()),
        }
    }
}

impl fmt::Display for Unit {
    /// Renders the printable form used in logs: `+` for null, `-` prefixed
    /// error messages, and comma-joined children for composites.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Scalar(Scalar::Null) => write!(f, "+"),
            Unit::Scalar(Scalar::Integer(v)) => write!(f, "{v}"),
            Unit::Scalar(Scalar::Bytes(b)) => write!(f, "{}", String::from_utf8_lossy(b)),
            Unit::Error(msg) => write!(f, "-{msg}"),
            Unit::Composite(children) => {
                write!(f, ":")?;
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{child}")?;
                }
                Ok(())
            }
        }
    }
}
