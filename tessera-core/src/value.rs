use rust_decimal::Decimal;
use std::{
    borrow::Cow,
    fmt::{self, Display},
};
use time::{Date, PrimitiveDateTime};
use uuid::Uuid;

/// Dynamically typed cell used for query parameters and row values.
///
/// Every variant wraps an `Option` so that a `None` payload doubles as the
/// description of a column type (a "typed NULL"), the same way field
/// descriptors declare their type.
#[derive(Default, Debug, Clone)]
pub enum Value {
    #[default]
    Null,
    Boolean(Option<bool>),
    Int8(Option<i8>),
    Int16(Option<i16>),
    Int32(Option<i32>),
    Int64(Option<i64>),
    UInt8(Option<u8>),
    UInt16(Option<u16>),
    UInt32(Option<u32>),
    UInt64(Option<u64>),
    Float32(Option<f32>),
    Float64(Option<f64>),
    Decimal(Option<Decimal>),
    Varchar(Option<Cow<'static, str>>),
    Date(Option<Date>),
    Timestamp(Option<PrimitiveDateTime>),
    Uuid(Option<Uuid>),
    Enum(Option<EnumValue>),
}

/// A variant of an application enum, with every representation an
/// [`EnumEncoding`](crate::EnumEncoding) may select.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnumValue {
    pub name: Cow<'static, str>,
    pub ordinal: u32,
    pub id: Option<i64>,
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Boolean(l), Self::Boolean(r)) => l == r,
            (Self::Int8(l), Self::Int8(r)) => l == r,
            (Self::Int16(l), Self::Int16(r)) => l == r,
            (Self::Int32(l), Self::Int32(r)) => l == r,
            (Self::Int64(l), Self::Int64(r)) => l == r,
            (Self::UInt8(l), Self::UInt8(r)) => l == r,
            (Self::UInt16(l), Self::UInt16(r)) => l == r,
            (Self::UInt32(l), Self::UInt32(r)) => l == r,
            (Self::UInt64(l), Self::UInt64(r)) => l == r,
            (Self::Float32(l), Self::Float32(r)) => l == r,
            (Self::Float64(l), Self::Float64(r)) => l == r,
            (Self::Decimal(l), Self::Decimal(r)) => l == r,
            (Self::Varchar(l), Self::Varchar(r)) => l == r,
            (Self::Date(l), Self::Date(r)) => l == r,
            (Self::Timestamp(l), Self::Timestamp(r)) => l == r,
            (Self::Uuid(l), Self::Uuid(r)) => l == r,
            (Self::Enum(l), Self::Enum(r)) => l == r,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl Value {
    pub fn same_type(&self, other: &Self) -> bool {
        core::mem::discriminant(self) == core::mem::discriminant(other)
    }

    /// True for `Null` and for any typed NULL.
    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Boolean(v) => v.is_none(),
            Value::Int8(v) => v.is_none(),
            Value::Int16(v) => v.is_none(),
            Value::Int32(v) => v.is_none(),
            Value::Int64(v) => v.is_none(),
            Value::UInt8(v) => v.is_none(),
            Value::UInt16(v) => v.is_none(),
            Value::UInt32(v) => v.is_none(),
            Value::UInt64(v) => v.is_none(),
            Value::Float32(v) => v.is_none(),
            Value::Float64(v) => v.is_none(),
            Value::Decimal(v) => v.is_none(),
            Value::Varchar(v) => v.is_none(),
            Value::Date(v) => v.is_none(),
            Value::Timestamp(v) => v.is_none(),
            Value::Uuid(v) => v.is_none(),
            Value::Enum(v) => v.is_none(),
        }
    }

    /// The typed NULL with the same variant as `self`.
    pub fn as_null(&self) -> Value {
        match self {
            Value::Null => Value::Null,
            Value::Boolean(..) => Value::Boolean(None),
            Value::Int8(..) => Value::Int8(None),
            Value::Int16(..) => Value::Int16(None),
            Value::Int32(..) => Value::Int32(None),
            Value::Int64(..) => Value::Int64(None),
            Value::UInt8(..) => Value::UInt8(None),
            Value::UInt16(..) => Value::UInt16(None),
            Value::UInt32(..) => Value::UInt32(None),
            Value::UInt64(..) => Value::UInt64(None),
            Value::Float32(..) => Value::Float32(None),
            Value::Float64(..) => Value::Float64(None),
            Value::Decimal(..) => Value::Decimal(None),
            Value::Varchar(..) => Value::Varchar(None),
            Value::Date(..) => Value::Date(None),
            Value::Timestamp(..) => Value::Timestamp(None),
            Value::Uuid(..) => Value::Uuid(None),
            Value::Enum(..) => Value::Enum(None),
        }
    }

    /// Widen any integer variant, `None` when the value is not an integer or is NULL.
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Int8(Some(v)) => Some(*v as i128),
            Value::Int16(Some(v)) => Some(*v as i128),
            Value::Int32(Some(v)) => Some(*v as i128),
            Value::Int64(Some(v)) => Some(*v as i128),
            Value::UInt8(Some(v)) => Some(*v as i128),
            Value::UInt16(Some(v)) => Some(*v as i128),
            Value::UInt32(Some(v)) => Some(*v as i128),
            Value::UInt64(Some(v)) => Some(*v as i128),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Boolean(..) => "BOOLEAN",
            Value::Int8(..) => "TINYINT",
            Value::Int16(..) => "SMALLINT",
            Value::Int32(..) => "INTEGER",
            Value::Int64(..) => "BIGINT",
            Value::UInt8(..) => "UTINYINT",
            Value::UInt16(..) => "USMALLINT",
            Value::UInt32(..) => "UINTEGER",
            Value::UInt64(..) => "UBIGINT",
            Value::Float32(..) => "FLOAT",
            Value::Float64(..) => "DOUBLE",
            Value::Decimal(..) => "DECIMAL",
            Value::Varchar(..) => "VARCHAR",
            Value::Date(..) => "DATE",
            Value::Timestamp(..) => "TIMESTAMP",
            Value::Uuid(..) => "UUID",
            Value::Enum(..) => "ENUM",
        }
    }
}

/// Plain textual rendering, without SQL quoting. NULLs render as the empty string.
impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(Some(v)) => write!(f, "{}", v),
            Value::Int8(Some(v)) => write!(f, "{}", v),
            Value::Int16(Some(v)) => write!(f, "{}", v),
            Value::Int32(Some(v)) => write!(f, "{}", v),
            Value::Int64(Some(v)) => write!(f, "{}", v),
            Value::UInt8(Some(v)) => write!(f, "{}", v),
            Value::UInt16(Some(v)) => write!(f, "{}", v),
            Value::UInt32(Some(v)) => write!(f, "{}", v),
            Value::UInt64(Some(v)) => write!(f, "{}", v),
            Value::Float32(Some(v)) => write!(f, "{}", v),
            Value::Float64(Some(v)) => write!(f, "{}", v),
            Value::Decimal(Some(v)) => write!(f, "{}", v),
            Value::Varchar(Some(v)) => f.write_str(v),
            Value::Date(Some(v)) => write!(f, "{}", v),
            Value::Timestamp(Some(v)) => write!(f, "{} {}", v.date(), v.time()),
            Value::Uuid(Some(v)) => write!(f, "{}", v),
            Value::Enum(Some(v)) => f.write_str(&v.name),
            _ => Ok(()),
        }
    }
}
