//! Payload serialization.
//!
//! Parameters travel as a list of [`Value`]s (the CBOR data model), so hosted
//! operations and proxies agree on shape without sharing Rust types. [`Parameters`]
//! converts typed argument tuples to and from that list.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

pub use ciborium::Value;

/// Key used by [`ObjectRef`] when encoded as a map.
pub const OBJECT_REF_KEY: &str = "$ref";

/// A call or event: operation name plus its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallInfo {
    /// Operation or event name.
    pub operation_name: String,
    /// Positional parameters.
    pub parameters: Vec<Value>,
}

impl CallInfo {
    /// Create a call.
    pub fn new(operation_name: impl Into<String>, parameters: Vec<Value>) -> Self {
        Self {
            operation_name: operation_name.into(),
            parameters,
        }
    }
}

/// Converts values and calls to and from payload bytes.
pub trait Serializer: Send + Sync + 'static {
    /// Encode a list of values.
    ///
    /// # Errors
    ///
    /// Fails if a value cannot be encoded.
    fn serialize(&self, values: &[Value]) -> Result<Bytes, CodecError>;

    /// Decode a list of values.
    ///
    /// # Errors
    ///
    /// Fails on malformed input.
    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<Value>, CodecError>;

    /// Encode a call.
    ///
    /// # Errors
    ///
    /// Fails if a parameter cannot be encoded.
    fn serialize_call(&self, call: &CallInfo) -> Result<Bytes, CodecError>;

    /// Decode a call.
    ///
    /// # Errors
    ///
    /// Fails on malformed input.
    fn deserialize_call(&self, bytes: &[u8]) -> Result<CallInfo, CodecError>;
}

/// Default serializer: CBOR via `ciborium`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborSerializer;

impl CborSerializer {
    /// Create a CBOR serializer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Serializer for CborSerializer {
    fn serialize(&self, values: &[Value]) -> Result<Bytes, CodecError> {
        encode(values)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<Value>, CodecError> {
        decode(bytes)
    }

    fn serialize_call(&self, call: &CallInfo) -> Result<Bytes, CodecError> {
        encode(call)
    }

    fn deserialize_call(&self, bytes: &[u8]) -> Result<CallInfo, CodecError> {
        decode(bytes)
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, CodecError> {
    let mut vec = Vec::new();
    ciborium::ser::into_writer(value, &mut vec)?;
    Ok(Bytes::from(vec))
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
    Ok(ciborium::de::from_reader(data)?)
}

/// Convert a typed value to a [`Value`].
///
/// # Errors
///
/// Fails if `value` cannot be represented.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, CodecError> {
    Value::serialized(value).map_err(|e| CodecError::SerializationFailed(e.to_string()))
}

/// Convert a [`Value`] to a typed value.
///
/// # Errors
///
/// Fails if `value` does not have the shape of `T`.
pub fn from_value<T: DeserializeOwned>(value: &Value) -> Result<T, CodecError> {
    value
        .deserialized()
        .map_err(|e| CodecError::DeserializationFailed(e.to_string()))
}

/// Reference to a hosted object, passed as a call parameter.
///
/// Encodes as `{"$ref": object_id}`; the server resolves it against its repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Id the object is hosted under.
    #[serde(rename = "$ref")]
    pub object_id: String,
}

impl ObjectRef {
    /// Create a reference.
    pub fn new(object_id: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
        }
    }

    /// The referenced id if `value` is an encoded reference.
    #[must_use]
    pub fn peek(value: &Value) -> Option<&str> {
        let Value::Map(entries) = value else {
            return None;
        };
        match entries.as_slice() {
            [(Value::Text(key), Value::Text(id))] if key == OBJECT_REF_KEY => Some(id.as_str()),
            _ => None,
        }
    }
}

/// Every object id referenced anywhere in `values`, nested arrays and maps included.
#[must_use]
pub fn referenced_objects(values: &[Value]) -> Vec<&str> {
    fn walk<'a>(value: &'a Value, found: &mut Vec<&'a str>) {
        if let Some(id) = ObjectRef::peek(value) {
            found.push(id);
            return;
        }
        match value {
            Value::Array(items) => items.iter().for_each(|item| walk(item, found)),
            Value::Map(entries) => entries.iter().for_each(|(_, item)| walk(item, found)),
            Value::Tag(_, inner) => walk(inner, found),
            _ => {}
        }
    }

    let mut found = Vec::new();
    values.iter().for_each(|value| walk(value, &mut found));
    found
}

/// A typed positional parameter list.
///
/// Implemented for tuples of up to eight elements; `()` is the empty list and a
/// one-element list is written `(T,)`.
pub trait Parameters: Sized + Send + 'static {
    /// Number of parameters.
    const ARITY: usize;

    /// Encode each element.
    ///
    /// # Errors
    ///
    /// Fails if an element cannot be represented.
    fn to_values(&self) -> Result<Vec<Value>, CodecError>;

    /// Decode from a list of exactly [`Self::ARITY`] values.
    ///
    /// # Errors
    ///
    /// Fails on a length mismatch or an element of the wrong shape.
    fn from_values(values: &[Value]) -> Result<Self, CodecError>;
}

macro_rules! impl_parameters {
    ($arity:expr; $($name:ident),*) => {
        impl<$($name),*> Parameters for ($($name,)*)
        where
            $($name: Serialize + DeserializeOwned + Send + 'static),*
        {
            const ARITY: usize = $arity;

            #[allow(non_snake_case)]
            fn to_values(&self) -> Result<Vec<Value>, CodecError> {
                let ($($name,)*) = self;
                Ok(vec![$(to_value($name)?),*])
            }

            #[allow(non_snake_case, unused_variables, unused_mut)]
            fn from_values(values: &[Value]) -> Result<Self, CodecError> {
                if values.len() != $arity {
                    return Err(CodecError::ArityMismatch {
                        expected: $arity,
                        actual: values.len(),
                    });
                }
                let mut iter = values.iter();
                Ok(($(from_value::<$name>(iter.next().unwrap_or(&Value::Null))?,)*))
            }
        }
    };
}

impl_parameters!(0;);
impl_parameters!(1; A);
impl_parameters!(2; A, B);
impl_parameters!(3; A, B, C);
impl_parameters!(4; A, B, C, D);
impl_parameters!(5; A, B, C, D, E);
impl_parameters!(6; A, B, C, D, E, F);
impl_parameters!(7; A, B, C, D, E, F, G);
impl_parameters!(8; A, B, C, D, E, F, G, H);
