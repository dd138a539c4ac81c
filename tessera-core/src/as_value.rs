use crate::{EngineError, EnumEncoding, EnumValue, Error, Result, Value};
use anyhow::Context;
use rust_decimal::{
    Decimal,
    prelude::{FromPrimitive, ToPrimitive},
};
use std::{any, borrow::Cow};
use time::{Date, PrimitiveDateTime, format_description::well_known::Iso8601, macros::format_description};
use uuid::Uuid;

/// Conversion between native Rust types and the dynamically typed [`Value`].
///
/// # Conversion contract
/// - `as_value` wraps the native value in its canonical variant.
/// - `try_from_value` accepts the canonical variant and, for numbers, any other
///   integer width after a range check. Textual values are parsed where the
///   target has an unambiguous textual form (dates, uuids).
/// - A mismatch returns an error naming both the value and the target type.
///
/// ```rust
/// use tessera_core::{AsValue, Value};
/// let v = 42i32.as_value();
/// assert_eq!(v, Value::Int32(Some(42)));
/// let n: i64 = AsValue::try_from_value(v).unwrap();
/// assert_eq!(n, 42);
/// ```
pub trait AsValue {
    /// The typed NULL for `Self`, doubling as its column type.
    fn as_empty_value() -> Value;
    fn as_value(self) -> Value;
    fn try_from_value(value: Value) -> Result<Self>
    where
        Self: Sized;
}

fn mismatch<T>(value: &Value) -> Error {
    Error::msg(format!(
        "Cannot convert {}({}) into {}",
        value.type_name(),
        value,
        any::type_name::<T>()
    ))
}

macro_rules! impl_as_value_integer {
    ($source:ty, $variant:path) => {
        impl AsValue for $source {
            fn as_empty_value() -> Value {
                $variant(None)
            }
            fn as_value(self) -> Value {
                $variant(Some(self))
            }
            fn try_from_value(value: Value) -> Result<Self> {
                if let $variant(Some(v)) = value {
                    return Ok(v);
                }
                let Some(wide) = value.as_i128() else {
                    return Err(mismatch::<Self>(&value));
                };
                <$source>::try_from(wide).map_err(|_| {
                    Error::msg(format!(
                        "Value {} is out of range for {}",
                        wide,
                        any::type_name::<Self>()
                    ))
                })
            }
        }
    };
}

impl_as_value_integer!(i8, Value::Int8);
impl_as_value_integer!(i16, Value::Int16);
impl_as_value_integer!(i32, Value::Int32);
impl_as_value_integer!(i64, Value::Int64);
impl_as_value_integer!(u8, Value::UInt8);
impl_as_value_integer!(u16, Value::UInt16);
impl_as_value_integer!(u32, Value::UInt32);
impl_as_value_integer!(u64, Value::UInt64);

macro_rules! impl_as_value_float {
    ($source:ty, $variant:path) => {
        impl AsValue for $source {
            fn as_empty_value() -> Value {
                $variant(None)
            }
            fn as_value(self) -> Value {
                $variant(Some(self))
            }
            fn try_from_value(value: Value) -> Result<Self> {
                match value {
                    $variant(Some(v)) => Ok(v),
                    Value::Float32(Some(v)) => Ok(v as $source),
                    Value::Float64(Some(v)) => Ok(v as $source),
                    Value::Decimal(Some(v)) => v
                        .to_f64()
                        .map(|v| v as $source)
                        .ok_or_else(|| Error::msg(format!("Decimal {} does not fit a float", v))),
                    ref other => other
                        .as_i128()
                        .map(|v| v as $source)
                        .ok_or_else(|| mismatch::<Self>(other)),
                }
            }
        }
    };
}

impl_as_value_float!(f32, Value::Float32);
impl_as_value_float!(f64, Value::Float64);

impl AsValue for bool {
    fn as_empty_value() -> Value {
        Value::Boolean(None)
    }
    fn as_value(self) -> Value {
        Value::Boolean(Some(self))
    }
    fn try_from_value(value: Value) -> Result<Self> {
        match value {
            Value::Boolean(Some(v)) => Ok(v),
            ref other => other
                .as_i128()
                .map(|v| v != 0)
                .ok_or_else(|| mismatch::<Self>(other)),
        }
    }
}

impl AsValue for Decimal {
    fn as_empty_value() -> Value {
        Value::Decimal(None)
    }
    fn as_value(self) -> Value {
        Value::Decimal(Some(self))
    }
    fn try_from_value(value: Value) -> Result<Self> {
        match value {
            Value::Decimal(Some(v)) => Ok(v),
            Value::Float32(Some(v)) => Decimal::from_f32(v).ok_or_else(|| mismatch::<Self>(&value)),
            Value::Float64(Some(v)) => Decimal::from_f64(v).ok_or_else(|| mismatch::<Self>(&value)),
            Value::Varchar(Some(ref v)) => v
                .parse::<Decimal>()
                .with_context(|| format!("Cannot parse `{}` as a decimal", v)),
            ref other => other
                .as_i128()
                .and_then(Decimal::from_i128)
                .ok_or_else(|| mismatch::<Self>(other)),
        }
    }
}

impl AsValue for String {
    fn as_empty_value() -> Value {
        Value::Varchar(None)
    }
    fn as_value(self) -> Value {
        Value::Varchar(Some(self.into()))
    }
    fn try_from_value(value: Value) -> Result<Self> {
        match value {
            Value::Varchar(Some(v)) => Ok(v.into_owned()),
            Value::Enum(Some(v)) => Ok(v.name.into_owned()),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl AsValue for &'static str {
    fn as_empty_value() -> Value {
        Value::Varchar(None)
    }
    fn as_value(self) -> Value {
        Value::Varchar(Some(Cow::Borrowed(self)))
    }
    fn try_from_value(value: Value) -> Result<Self> {
        match value {
            Value::Varchar(Some(Cow::Borrowed(v))) => Ok(v),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl AsValue for Date {
    fn as_empty_value() -> Value {
        Value::Date(None)
    }
    fn as_value(self) -> Value {
        Value::Date(Some(self))
    }
    fn try_from_value(value: Value) -> Result<Self> {
        match value {
            Value::Date(Some(v)) => Ok(v),
            Value::Timestamp(Some(v)) => Ok(v.date()),
            Value::Varchar(Some(ref v)) => Date::parse(v, format_description!("[year]-[month]-[day]"))
                .with_context(|| format!("Cannot parse `{}` as a date", v)),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl AsValue for PrimitiveDateTime {
    fn as_empty_value() -> Value {
        Value::Timestamp(None)
    }
    fn as_value(self) -> Value {
        Value::Timestamp(Some(self))
    }
    fn try_from_value(value: Value) -> Result<Self> {
        match value {
            Value::Timestamp(Some(v)) => Ok(v),
            Value::Varchar(Some(ref v)) => PrimitiveDateTime::parse(
                v,
                format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
            )
            .or_else(|_| PrimitiveDateTime::parse(v, &Iso8601::DEFAULT))
            .with_context(|| format!("Cannot parse `{}` as a timestamp", v)),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl AsValue for Uuid {
    fn as_empty_value() -> Value {
        Value::Uuid(None)
    }
    fn as_value(self) -> Value {
        Value::Uuid(Some(self))
    }
    fn try_from_value(value: Value) -> Result<Self> {
        match value {
            Value::Uuid(Some(v)) => Ok(v),
            Value::Varchar(Some(ref v)) => {
                Uuid::parse_str(v).with_context(|| format!("Cannot parse `{}` as a uuid", v))
            }
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl AsValue for EnumValue {
    fn as_empty_value() -> Value {
        Value::Enum(None)
    }
    fn as_value(self) -> Value {
        Value::Enum(Some(self))
    }
    fn try_from_value(value: Value) -> Result<Self> {
        match value {
            Value::Enum(Some(v)) => Ok(v),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl<T: AsValue> AsValue for Option<T> {
    fn as_empty_value() -> Value {
        T::as_empty_value()
    }
    fn as_value(self) -> Value {
        match self {
            Some(v) => v.as_value(),
            None => T::as_empty_value(),
        }
    }
    fn try_from_value(value: Value) -> Result<Self> {
        if value.is_null() {
            return Ok(None);
        }
        T::try_from_value(value).map(Some)
    }
}

impl From<&'static str> for Value {
    fn from(value: &'static str) -> Self {
        value.as_value()
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        value.as_value()
    }
}

macro_rules! impl_value_from {
    ($($source:ty),+ $(,)?) => {
        $(impl From<$source> for Value {
            fn from(value: $source) -> Self {
                value.as_value()
            }
        })+
    };
}

impl_value_from!(
    bool,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    u64,
    f32,
    f64,
    Decimal,
    Date,
    PrimitiveDateTime,
    Uuid,
    EnumValue
);

/// Application enums stored through an [`EnumEncoding`].
///
/// `ordinal` defaults to the position in [`DbEnum::variants`]; `id` is only
/// needed by enums stored with [`EnumEncoding::ById`].
pub trait DbEnum: Sized + Clone + 'static {
    fn variants() -> &'static [Self];
    fn name(&self) -> &'static str;
    fn ordinal(&self) -> u32 {
        Self::variants()
            .iter()
            .position(|v| v.name() == self.name())
            .unwrap_or_default() as u32
    }
    fn id(&self) -> Option<i64> {
        None
    }

    fn as_enum_value(&self) -> Value {
        Value::Enum(Some(EnumValue {
            name: Cow::Borrowed(self.name()),
            ordinal: self.ordinal(),
            id: self.id(),
        }))
    }

    /// Decode a stored value according to the column encoding.
    fn from_value(value: Value, encoding: EnumEncoding) -> Result<Self> {
        let found = match (&value, encoding) {
            (Value::Enum(Some(v)), _) => Self::variants().iter().find(|e| e.name() == v.name),
            (Value::Varchar(Some(v)), _) => Self::variants().iter().find(|e| e.name() == v.as_ref()),
            (v, EnumEncoding::Ordinal) => v.as_i128().and_then(|ordinal| {
                Self::variants()
                    .iter()
                    .find(|e| e.ordinal() as i128 == ordinal)
            }),
            (v, EnumEncoding::ById) => v
                .as_i128()
                .and_then(|id| Self::variants().iter().find(|e| e.id().map(i128::from) == Some(id))),
            (_, EnumEncoding::String) => None,
        };
        found.cloned().ok_or_else(|| {
            Error::new(EngineError::UnsupportedEnumEncoding {
                value: value.to_string(),
                target: any::type_name::<Self>(),
                encoding,
            })
        })
    }
}
