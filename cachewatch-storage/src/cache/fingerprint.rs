//! Call-argument fingerprinting.

use std::collections::BTreeMap;
use std::fmt;

use serde::ser::{self, Error as _, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Positional and keyword arguments of one call.
///
/// Keyword order never affects the fingerprint: `kwarg("a", 1).kwarg("b", 2)`
/// and `kwarg("b", 2).kwarg("a", 1)` produce the same [`CallKey`].
///
/// Values are JSON, so a non-finite float is already `null` by the time it
/// reaches `CallArgs`. Pass such arguments as a typed value to
/// [`CallKey::of`] instead.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct CallArgs {
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument, replacing any earlier value for `name`.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &BTreeMap<String, Value> {
        &self.kwargs
    }
}

/// SHA-256 fingerprint of a call's arguments in canonical JSON form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallKey([u8; 32]);

impl CallKey {
    /// Fingerprint any serializable argument value.
    ///
    /// Object keys are sorted recursively before hashing, so struct field
    /// order and map insertion order are irrelevant.
    ///
    /// # Errors
    ///
    /// Fails if `args` cannot be represented as JSON without loss: a map with
    /// non-string keys, or a NaN or infinite float (JSON would encode it as
    /// `null`).
    pub fn of<A: Serialize + ?Sized>(args: &A) -> Result<Self, serde_json::Error> {
        args.serialize(FiniteFloats)?;
        let canonical = canonicalize(serde_json::to_value(args)?);
        let bytes = serde_json::to_vec(&canonical)?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        Ok(Self(hash))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(String, Value)> = object.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

// ============================================================================
// FLOAT CHECK
// ============================================================================

/// Serializer that produces nothing and fails on any non-finite float.
#[derive(Clone, Copy)]
struct FiniteFloats;

fn check_float(value: f64) -> Result<(), serde_json::Error> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(serde_json::Error::custom(format!(
            "non-finite float {} has no JSON representation",
            value
        )))
    }
}

impl Serializer for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _: bool) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_i8(self, _: i8) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_i16(self, _: i16) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_i32(self, _: i32) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_i64(self, _: i64) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_i128(self, _: i128) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_u8(self, _: u8) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_u16(self, _: u16) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_u32(self, _: u32) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_u64(self, _: u64) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_u128(self, _: u128) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_f32(self, value: f32) -> Result<(), Self::Error> {
        check_float(f64::from(value))
    }

    fn serialize_f64(self, value: f64) -> Result<(), Self::Error> {
        check_float(value)
    }

    fn serialize_char(self, _: char) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_str(self, _: &str) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_bytes(self, _: &[u8]) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_none(self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_some<T>(self, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_unit_struct(self, _: &'static str) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    fn serialize_newtype_struct<T>(self, _: &'static str, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        value: &T,
    ) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_seq(self, _: Option<usize>) -> Result<Self, Self::Error> {
        Ok(self)
    }

    fn serialize_tuple(self, _: usize) -> Result<Self, Self::Error> {
        Ok(self)
    }

    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Self, Self::Error> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, Self::Error> {
        Ok(self)
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self, Self::Error> {
        Ok(self)
    }

    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self, Self::Error> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, Self::Error> {
        Ok(self)
    }
}

impl ser::SerializeSeq for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeTuple for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeMap for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_key<T>(&mut self, key: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        key.serialize(*self)
    }

    fn serialize_value<T>(&mut self, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeStruct for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T>(&mut self, _: &'static str, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for FiniteFloats {
    type Ok = ();
    type Error = serde_json::Error;

    fn serialize_field<T>(&mut self, _: &'static str, value: &T) -> Result<(), Self::Error>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}
