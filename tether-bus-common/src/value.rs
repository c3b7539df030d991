use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Maximum nesting of arrays inside a single argument
pub const MAX_ARRAY_DEPTH: usize = 32;
/// Maximum nesting of structs inside a single argument
pub const MAX_STRUCT_DEPTH: usize = 32;
/// Maximum signature length in bytes
pub const MAX_SIGNATURE_LEN: usize = 255;

/// Wire type of a single argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgType {
    Boolean,
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    Array,
    Struct,
    Variant,
    Dict,
}

impl ArgType {
    /// Basic types are the only types allowed as dictionary keys
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            ArgType::Array | ArgType::Struct | ArgType::Variant | ArgType::Dict
        )
    }
}

/// A single self-describing message argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Boolean(bool),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    ObjectPath(String),
    Signature(String),
    /// Homogeneous array. `element` is the signature of every item
    Array { element: String, items: Vec<Value> },
    Struct(Vec<Value>),
    Variant(Box<Value>),
    Dict {
        key: String,
        value: String,
        entries: Vec<(Value, Value)>,
    },
}

impl Value {
    /// Make an array of `element` typed values
    pub fn array(element: &str, items: Vec<Value>) -> Self {
        Value::Array {
            element: element.to_owned(),
            items,
        }
    }

    /// Make a string array argument
    pub fn strings<S: AsRef<str>>(items: &[S]) -> Self {
        Value::array(
            "s",
            items
                .iter()
                .map(|item| Value::String(item.as_ref().to_owned()))
                .collect(),
        )
    }

    pub fn arg_type(&self) -> ArgType {
        match self {
            Value::Boolean(_) => ArgType::Boolean,
            Value::Byte(_) => ArgType::Byte,
            Value::Int16(_) => ArgType::Int16,
            Value::UInt16(_) => ArgType::UInt16,
            Value::Int32(_) => ArgType::Int32,
            Value::UInt32(_) => ArgType::UInt32,
            Value::Int64(_) => ArgType::Int64,
            Value::UInt64(_) => ArgType::UInt64,
            Value::Double(_) => ArgType::Double,
            Value::String(_) => ArgType::String,
            Value::ObjectPath(_) => ArgType::ObjectPath,
            Value::Signature(_) => ArgType::Signature,
            Value::Array { .. } => ArgType::Array,
            Value::Struct(_) => ArgType::Struct,
            Value::Variant(_) => ArgType::Variant,
            Value::Dict { .. } => ArgType::Dict,
        }
    }

    /// Wire signature of the value
    pub fn signature(&self) -> String {
        match self {
            Value::Boolean(_) => "b".into(),
            Value::Byte(_) => "y".into(),
            Value::Int16(_) => "n".into(),
            Value::UInt16(_) => "q".into(),
            Value::Int32(_) => "i".into(),
            Value::UInt32(_) => "u".into(),
            Value::Int64(_) => "x".into(),
            Value::UInt64(_) => "t".into(),
            Value::Double(_) => "d".into(),
            Value::String(_) => "s".into(),
            Value::ObjectPath(_) => "o".into(),
            Value::Signature(_) => "g".into(),
            Value::Array { element, .. } => format!("a{element}"),
            Value::Struct(fields) => {
                let inner: String = fields.iter().map(Value::signature).collect();
                format!("({inner})")
            }
            Value::Variant(_) => "v".into(),
            Value::Dict { key, value, .. } => format!("a{{{key}{value}}}"),
        }
    }

    /// Read the argument at the cursor position. Returns `false` and leaves the value
    /// untouched if the cursor is exhausted
    pub fn set(&mut self, cursor: &dyn ArgCursor) -> bool {
        match cursor.current() {
            Some(value) => {
                *self = value;
                true
            }
            None => false,
        }
    }

    /// Convert into a target type
    pub fn get<T: FromValue>(&self) -> Result<T> {
        T::from_value(self).ok_or_else(|| Error::TypeMismatch {
            expected: T::NAME,
            found: self.signature(),
        })
    }

    /// Check the value can be put on the wire
    pub fn validate(&self) -> Result<()> {
        self.check(0, 0)
    }

    fn check(&self, arrays: usize, structs: usize) -> Result<()> {
        match self {
            Value::String(s) if s.contains('\0') => Err(Error::Serialization(
                "string contains an embedded NUL".into(),
            )),
            Value::ObjectPath(path) if !is_object_path(path) => Err(Error::Serialization(
                format!("invalid object path '{path}'"),
            )),
            Value::Signature(sig) if !is_signature(sig) => Err(Error::Serialization(format!(
                "invalid signature '{sig}'"
            ))),
            Value::Array { element, items } => {
                if arrays + 1 > MAX_ARRAY_DEPTH {
                    return Err(Error::Serialization("array nesting too deep".into()));
                }

                if !is_single_type(element) {
                    return Err(Error::Serialization(format!(
                        "invalid array element signature '{element}'"
                    )));
                }

                for item in items {
                    if item.signature() != *element {
                        return Err(Error::Serialization(format!(
                            "array of '{element}' contains '{}'",
                            item.signature()
                        )));
                    }
                    item.check(arrays + 1, structs)?;
                }

                Ok(())
            }
            Value::Struct(fields) => {
                if fields.is_empty() {
                    return Err(Error::Serialization("empty struct".into()));
                }

                if structs + 1 > MAX_STRUCT_DEPTH {
                    return Err(Error::Serialization("struct nesting too deep".into()));
                }

                fields
                    .iter()
                    .try_for_each(|field| field.check(arrays, structs + 1))
            }
            Value::Variant(inner) => inner.check(arrays, structs),
            Value::Dict {
                key,
                value,
                entries,
            } => {
                if arrays + 1 > MAX_ARRAY_DEPTH || structs + 1 > MAX_STRUCT_DEPTH {
                    return Err(Error::Serialization("dictionary nesting too deep".into()));
                }

                if !is_signature(&format!("a{{{key}{value}}}")) {
                    return Err(Error::Serialization(format!(
                        "invalid dictionary signature '{key}{value}'"
                    )));
                }

                for (k, v) in entries {
                    if k.signature() != *key || v.signature() != *value {
                        return Err(Error::Serialization(format!(
                            "dictionary of '{key}{value}' contains '{}{}'",
                            k.signature(),
                            v.signature()
                        )));
                    }
                    k.check(arrays + 1, structs + 1)?;
                    v.check(arrays + 1, structs + 1)?;
                }

                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Byte(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::UInt16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) | Value::ObjectPath(v) | Value::Signature(v) => f.write_str(v),
            Value::Array { items, .. } => {
                f.write_str("[")?;
                write_list(f, items)?;
                f.write_str("]")
            }
            Value::Struct(fields) => {
                f.write_str("(")?;
                write_list(f, fields)?;
                f.write_str(")")
            }
            Value::Variant(inner) => inner.fmt(f),
            Value::Dict { entries, .. } => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                f.write_str("}")
            }
        }
    }
}

fn write_list(f: &mut Formatter<'_>, values: &[Value]) -> fmt::Result {
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        value.fmt(f)?;
    }
    Ok(())
}

fn is_basic_code(code: u8) -> bool {
    matches!(
        code,
        b'b' | b'y' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g' | b'h'
    )
}

/// Length of the first complete type of `sig`
fn single_type_len(sig: &[u8]) -> Option<usize> {
    match *sig.first()? {
        code if is_basic_code(code) || code == b'v' => Some(1),
        b'a' if sig.get(1) == Some(&b'{') => {
            if !is_basic_code(*sig.get(2)?) {
                return None;
            }

            let value_len = single_type_len(sig.get(3..)?)?;
            match sig.get(3 + value_len) {
                Some(b'}') => Some(4 + value_len),
                _ => None,
            }
        }
        b'a' => Some(1 + single_type_len(&sig[1..])?),
        b'(' => {
            let mut position = 1;
            loop {
                match *sig.get(position)? {
                    b')' if position > 1 => return Some(position + 1),
                    b')' => return None,
                    _ => position += single_type_len(&sig[position..])?,
                }
            }
        }
        _ => None,
    }
}

/// If `sig` is exactly one complete type
pub fn is_single_type(sig: &str) -> bool {
    sig.len() <= MAX_SIGNATURE_LEN && single_type_len(sig.as_bytes()) == Some(sig.len())
}

/// If `sig` is a sequence of complete types
pub fn is_signature(sig: &str) -> bool {
    if sig.len() > MAX_SIGNATURE_LEN {
        return false;
    }

    let bytes = sig.as_bytes();
    let mut position = 0;
    while position < bytes.len() {
        match single_type_len(&bytes[position..]) {
            Some(len) => position += len,
            None => return false,
        }
    }

    true
}

pub fn is_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }

    match path.strip_prefix('/') {
        Some(rest) => rest.split('/').all(|element| {
            !element.is_empty()
                && element
                    .bytes()
                    .all(|c| c.is_ascii_alphanumeric() || c == b'_')
        }),
        None => false,
    }
}

/// Typed extraction from a [Value]
pub trait FromValue: Sized {
    /// Target type name for error reporting
    const NAME: &'static str;

    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! integer_from_value {
    ($($target:ty),*) => {
        $(
            impl FromValue for $target {
                const NAME: &'static str = stringify!($target);

                fn from_value(value: &Value) -> Option<Self> {
                    match value {
                        Value::Byte(v) => <$target>::try_from(*v).ok(),
                        Value::Int16(v) => <$target>::try_from(*v).ok(),
                        Value::UInt16(v) => <$target>::try_from(*v).ok(),
                        Value::Int32(v) => <$target>::try_from(*v).ok(),
                        Value::UInt32(v) => <$target>::try_from(*v).ok(),
                        Value::Int64(v) => <$target>::try_from(*v).ok(),
                        Value::UInt64(v) => <$target>::try_from(*v).ok(),
                        Value::Variant(inner) => Self::from_value(inner),
                        _ => None,
                    }
                }
            }
        )*
    };
}

integer_from_value!(u8, i16, u16, i32, u32, i64, u64);

impl FromValue for bool {
    const NAME: &'static str = "bool";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Boolean(v) => Some(*v),
            Value::Variant(inner) => Self::from_value(inner),
            _ => None,
        }
    }
}

impl FromValue for f64 {
    const NAME: &'static str = "f64";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Double(v) => Some(*v),
            Value::Byte(v) => Some((*v).into()),
            Value::Int16(v) => Some((*v).into()),
            Value::UInt16(v) => Some((*v).into()),
            Value::Int32(v) => Some((*v).into()),
            Value::UInt32(v) => Some((*v).into()),
            Value::Variant(inner) => Self::from_value(inner),
            _ => None,
        }
    }
}

impl FromValue for String {
    const NAME: &'static str = "String";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(v) | Value::ObjectPath(v) | Value::Signature(v) => Some(v.clone()),
            Value::Variant(inner) => Self::from_value(inner),
            _ => None,
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    const NAME: &'static str = "Vec";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Array { items, .. } => items.iter().map(T::from_value).collect(),
            Value::Variant(inner) => Self::from_value(inner),
            _ => None,
        }
    }
}

impl FromValue for Value {
    const NAME: &'static str = "Value";

    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

macro_rules! value_from {
    ($($source:ty => $variant:ident),*) => {
        $(
            impl From<$source> for Value {
                fn from(value: $source) -> Self {
                    Value::$variant(value)
                }
            }
        )*
    };
}

value_from!(
    bool => Boolean,
    u8 => Byte,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Double,
    String => String
);

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<Vec<String>> for Value {
    fn from(value: Vec<String>) -> Self {
        Value::strings(&value)
    }
}

/// Read position inside a message argument list
pub trait ArgCursor {
    /// Decode the argument at the current position. `None` if the list is exhausted
    fn current(&self) -> Option<Value>;

    /// Move to the next argument. Returns `false` if there is no argument at the new position
    fn next(&mut self) -> bool;
}

/// Cursor over already decoded arguments
#[derive(Debug, Clone)]
pub struct SliceCursor<'a> {
    args: &'a [Value],
    position: usize,
}

impl<'a> SliceCursor<'a> {
    pub fn new(args: &'a [Value]) -> Self {
        Self { args, position: 0 }
    }

    pub fn at(args: &'a [Value], position: usize) -> Self {
        Self { args, position }
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

impl<'a> ArgCursor for SliceCursor<'a> {
    fn current(&self) -> Option<Value> {
        self.args.get(self.position).cloned()
    }

    fn next(&mut self) -> bool {
        if self.position < self.args.len() {
            self.position += 1;
        }
        self.position < self.args.len()
    }
}
