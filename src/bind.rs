//! Conversions between semantic [`Value`]s and driver-level [`SqlParam`]s.

use crate::driver::Statement;
use crate::error::Error;
use crate::value::{SqlParam, SqlType, Value, ValueType};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

/// Maps a value to the bind call the driver should receive.
///
/// Arms are ordered from specific to generic: the zoned timestamp is bound as
/// wall-clock time in its own offset before plain timestamps and dates are
/// considered, and the final arm binds the string form of whatever is left.
pub fn to_param(value: &Value) -> SqlParam {
    match value {
        Value::Null => SqlParam::Null(SqlType::Varchar),
        Value::TimestampTz(ts) => SqlParam::Timestamp(ts.naive_local()),
        Value::Timestamp(ts) => SqlParam::Timestamp(*ts),
        Value::Date(d) => SqlParam::Date(*d),
        Value::Int(v) => SqlParam::Int(*v),
        Value::Long(v) => SqlParam::Long(*v),
        Value::Double(v) => SqlParam::Double(*v),
        Value::Bool(v) => SqlParam::Bool(*v),
        Value::Blob(bytes) => SqlParam::Bytes(bytes.clone()),
        Value::Clob(text) => SqlParam::Text(text.clone()),
        Value::Ref(entity) => SqlParam::String(entity.id.clone()),
        other => SqlParam::String(other.to_string()),
    }
}

/// Binds `value` at one 1-based position.
pub fn bind_value<S>(statement: &mut S, position: usize, value: &Value) -> crate::Result<()>
where
    S: Statement + ?Sized,
{
    let param = to_param(value);
    tracing::trace!(position, sql_type = ?param.sql_type(), "bind");
    statement.set_param(position, param)
}

/// Binds the same value at every position of a repeated named parameter.
pub fn bind_positions<S>(statement: &mut S, positions: &[usize], value: &Value) -> crate::Result<()>
where
    S: Statement + ?Sized,
{
    for &position in positions {
        bind_value(statement, position, value)?;
    }
    Ok(())
}

/// Coerces a raw column value to `target`.
///
/// Null stays null for every target. Anything that cannot be represented in the
/// target type fails with [`Error::Extract`] naming the value and the target.
pub fn extract(value: &Value, target: &ValueType) -> crate::Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let fail = || Error::extract(format!("{} '{}'", value.type_name(), value), target);

    let converted = match target {
        ValueType::String => match value {
            Value::String(_) => value.clone(),
            Value::Clob(s) => Value::String(s.clone()),
            Value::Blob(bytes) => {
                Value::String(String::from_utf8(bytes.clone()).map_err(|_| fail())?)
            }
            other => Value::String(other.to_string()),
        },
        ValueType::Integer => {
            let wide = to_i64(value).ok_or_else(fail)?;
            Value::Int(i32::try_from(wide).map_err(|_| fail())?)
        }
        ValueType::Long => Value::Long(to_i64(value).ok_or_else(fail)?),
        ValueType::Double => match value {
            Value::Int(v) => Value::Double(f64::from(*v)),
            Value::Long(v) => Value::Double(*v as f64),
            Value::Double(v) => Value::Double(*v),
            Value::String(s) | Value::Clob(s) => {
                Value::Double(s.trim().parse().map_err(|_| fail())?)
            }
            _ => return Err(fail()),
        },
        ValueType::Boolean => match value {
            Value::Bool(v) => Value::Bool(*v),
            Value::Int(v) => Value::Bool(*v != 0),
            Value::Long(v) => Value::Bool(*v != 0),
            Value::String(s) | Value::Clob(s) => Value::Bool(parse_bool(s).ok_or_else(fail)?),
            _ => return Err(fail()),
        },
        ValueType::Date(pattern) => match value {
            Value::Date(d) => Value::Date(*d),
            Value::Timestamp(ts) => Value::Date(ts.date()),
            Value::TimestampTz(ts) => Value::Date(ts.date_naive()),
            Value::String(s) | Value::Clob(s) => Value::Date(
                NaiveDate::parse_from_str(s.trim(), pattern).map_err(|_| fail())?,
            ),
            _ => return Err(fail()),
        },
        ValueType::Timestamp(pattern) => match value {
            Value::Timestamp(_) | Value::TimestampTz(_) => value.clone(),
            Value::Date(d) => Value::Timestamp(d.and_time(NaiveTime::MIN)),
            Value::String(s) | Value::Clob(s) => Value::Timestamp(
                NaiveDateTime::parse_from_str(s.trim(), pattern).map_err(|_| fail())?,
            ),
            _ => return Err(fail()),
        },
        ValueType::Bytes => match value {
            Value::Blob(bytes) => Value::Blob(bytes.clone()),
            Value::String(s) | Value::Clob(s) => Value::Blob(s.clone().into_bytes()),
            _ => return Err(fail()),
        },
    };
    Ok(converted)
}

fn to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Int(v) => Some(i64::from(*v)),
        Value::Long(v) => Some(*v),
        Value::Double(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => Some(*v as i64),
        Value::Bool(v) => Some(i64::from(*v)),
        Value::String(s) | Value::Clob(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::EntityRef;
    use chrono::{DateTime, FixedOffset, TimeZone};

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn test_null_binds_as_varchar_null() {
        assert_eq!(to_param(&Value::Null), SqlParam::Null(SqlType::Varchar));
    }

    #[test]
    fn test_zoned_timestamp_binds_wall_clock_of_its_offset() {
        let offset = FixedOffset::east_opt(9 * 3600).unwrap();
        let zoned: DateTime<FixedOffset> =
            offset.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).single().unwrap();
        assert_eq!(
            to_param(&Value::TimestampTz(zoned)),
            SqlParam::Timestamp(ts("2024-03-01 08:30:00"))
        );
    }

    #[test]
    fn test_specific_types_bind_before_string_fallback() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert_eq!(to_param(&Value::Date(date)), SqlParam::Date(date));
        assert_eq!(to_param(&Value::Int(3)), SqlParam::Int(3));
        assert_eq!(to_param(&Value::Long(3)), SqlParam::Long(3));
        assert_eq!(
            to_param(&Value::Ref(EntityRef::new("order", "ord-9"))),
            SqlParam::String("ord-9".into())
        );
        assert_eq!(to_param(&Value::Blob(vec![1])), SqlParam::Bytes(vec![1]));
        assert_eq!(to_param(&Value::Clob("c".into())), SqlParam::Text("c".into()));
        assert_eq!(to_param(&Value::from("s")), SqlParam::String("s".into()));
    }

    #[test]
    fn test_extract_numbers() {
        assert_eq!(extract(&Value::from("42"), &ValueType::Long).unwrap(), Value::Long(42));
        assert_eq!(extract(&Value::from(" 7 "), &ValueType::Integer).unwrap(), Value::Int(7));
        assert_eq!(extract(&Value::Long(7), &ValueType::Integer).unwrap(), Value::Int(7));
        assert_eq!(extract(&Value::Double(2.0), &ValueType::Long).unwrap(), Value::Long(2));
        assert_eq!(extract(&Value::Int(2), &ValueType::Double).unwrap(), Value::Double(2.0));
    }

    #[test]
    fn test_extract_failure_names_value_and_target() {
        let err = extract(&Value::from("abc"), &ValueType::Long).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("abc"), "{message}");
        assert!(message.contains("long"), "{message}");

        let overflow = extract(&Value::Long(i64::MAX), &ValueType::Integer);
        assert!(matches!(overflow, Err(Error::Extract { .. })));
    }

    #[test]
    fn test_extract_null_stays_null() {
        for target in [ValueType::Long, ValueType::Boolean, ValueType::Bytes] {
            assert_eq!(extract(&Value::Null, &target).unwrap(), Value::Null);
        }
    }

    #[test]
    fn test_extract_booleans() {
        assert_eq!(extract(&Value::from("Y"), &ValueType::Boolean).unwrap(), Value::Bool(true));
        assert_eq!(extract(&Value::Int(0), &ValueType::Boolean).unwrap(), Value::Bool(false));
        assert!(extract(&Value::from("maybe"), &ValueType::Boolean).is_err());
    }

    #[test]
    fn test_extract_dates_with_patterns() {
        let date = extract(&Value::from("02/01/2024"), &ValueType::Date("%d/%m/%Y".into()))
            .unwrap();
        assert_eq!(date, Value::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()));

        let stamp = extract(
            &Value::from("2024-01-02T10:11:12"),
            &ValueType::Timestamp("%Y-%m-%dT%H:%M:%S".into()),
        )
        .unwrap();
        assert_eq!(stamp, Value::Timestamp(ts("2024-01-02 10:11:12")));

        let midnight = extract(
            &Value::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()),
            &ValueType::Timestamp(String::new()),
        )
        .unwrap();
        assert_eq!(midnight, Value::Timestamp(ts("2024-01-02 00:00:00")));
    }

    #[test]
    fn test_extract_strings() {
        assert_eq!(extract(&Value::Int(5), &ValueType::String).unwrap(), Value::from("5"));
        assert_eq!(
            extract(&Value::Blob(b"hi".to_vec()), &ValueType::String).unwrap(),
            Value::from("hi")
        );
        assert!(extract(&Value::Blob(vec![0xff, 0xfe]), &ValueType::String).is_err());
    }
}
