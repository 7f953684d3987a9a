use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{DataType, RepoError, Result, Value};

/// Maps a Rust field type onto the dynamic value model.
///
/// `#[derive(Entity)]` reads `DATA_TYPE` and `NULLABLE` into the static
/// property descriptors and uses the conversions for property access.
pub trait FieldValue: Sized {
    const DATA_TYPE: DataType;
    const NULLABLE: bool = false;

    fn to_value(&self) -> Value;

    fn from_value(value: Value) -> Result<Self>;
}

fn unexpected(expected: DataType, value: &Value) -> RepoError {
    RepoError::TypeMismatch(format!(
        "Expected {}, got {} '{}'",
        expected,
        value.type_name(),
        value
    ))
}

macro_rules! integer_field {
    ($($ty:ty),*) => {
        $(
            impl FieldValue for $ty {
                const DATA_TYPE: DataType = DataType::Integer;

                fn to_value(&self) -> Value {
                    Value::Integer(*self as i64)
                }

                fn from_value(value: Value) -> Result<Self> {
                    match DataType::Integer.coerce(value)? {
                        Value::Integer(i) => <$ty>::try_from(i).map_err(|_| {
                            RepoError::TypeMismatch(format!(
                                "{} is out of range for {}",
                                i,
                                stringify!($ty)
                            ))
                        }),
                        other => Err(unexpected(DataType::Integer, &other)),
                    }
                }
            }
        )*
    };
}

integer_field!(i16, i32, i64, u16, u32);

impl FieldValue for f64 {
    const DATA_TYPE: DataType = DataType::Float;

    fn to_value(&self) -> Value {
        Value::Float(*self)
    }

    fn from_value(value: Value) -> Result<Self> {
        match DataType::Float.coerce(value)? {
            Value::Float(f) => Ok(f),
            other => Err(unexpected(DataType::Float, &other)),
        }
    }
}

impl FieldValue for f32 {
    const DATA_TYPE: DataType = DataType::Float;

    fn to_value(&self) -> Value {
        Value::Float(*self as f64)
    }

    fn from_value(value: Value) -> Result<Self> {
        f64::from_value(value).map(|f| f as f32)
    }
}

impl FieldValue for bool {
    const DATA_TYPE: DataType = DataType::Boolean;

    fn to_value(&self) -> Value {
        Value::Boolean(*self)
    }

    fn from_value(value: Value) -> Result<Self> {
        match DataType::Boolean.coerce(value)? {
            Value::Boolean(b) => Ok(b),
            other => Err(unexpected(DataType::Boolean, &other)),
        }
    }
}

impl FieldValue for String {
    const DATA_TYPE: DataType = DataType::Text;

    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }

    fn from_value(value: Value) -> Result<Self> {
        match DataType::Text.coerce(value)? {
            Value::Text(s) => Ok(s),
            other => Err(unexpected(DataType::Text, &other)),
        }
    }
}

impl FieldValue for Uuid {
    const DATA_TYPE: DataType = DataType::Uuid;

    fn to_value(&self) -> Value {
        Value::Uuid(*self)
    }

    fn from_value(value: Value) -> Result<Self> {
        match DataType::Uuid.coerce(value)? {
            Value::Uuid(u) => Ok(u),
            other => Err(unexpected(DataType::Uuid, &other)),
        }
    }
}

impl FieldValue for DateTime<Utc> {
    const DATA_TYPE: DataType = DataType::Timestamp;

    fn to_value(&self) -> Value {
        Value::Timestamp(*self)
    }

    fn from_value(value: Value) -> Result<Self> {
        match DataType::Timestamp.coerce(value)? {
            Value::Timestamp(ts) => Ok(ts),
            other => Err(unexpected(DataType::Timestamp, &other)),
        }
    }
}

impl<T: FieldValue> FieldValue for Option<T> {
    const DATA_TYPE: DataType = T::DATA_TYPE;
    const NULLABLE: bool = true;

    fn to_value(&self) -> Value {
        match self {
            Some(inner) => inner.to_value(),
            None => Value::Null,
        }
    }

    fn from_value(value: Value) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_range_check() {
        assert_eq!(i32::from_value(Value::Integer(7)).unwrap(), 7);
        assert!(i16::from_value(Value::Integer(1 << 20)).is_err());
        assert!(u32::from_value(Value::Integer(-1)).is_err());
    }

    #[test]
    fn test_null_into_required_field_fails() {
        assert!(String::from_value(Value::Null).is_err());
        assert_eq!(Option::<String>::from_value(Value::Null).unwrap(), None);
    }

    #[test]
    fn test_option_metadata() {
        assert!(<Option<i64> as FieldValue>::NULLABLE);
        assert_eq!(<Option<Uuid> as FieldValue>::DATA_TYPE, DataType::Uuid);
        assert!(!<i64 as FieldValue>::NULLABLE);
    }
}
