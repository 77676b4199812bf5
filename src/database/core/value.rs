//! Parameter and result value conversion
//!
//! Outbound values ([`Param`]) are converted into engine values before
//! binding; inbound engine values are converted into [`Value`]. Both
//! directions are total functions with explicit error cases, so a value that
//! cannot cross the boundary is reported instead of silently degraded.

use crate::database::error::{DbError, FailureKind, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rusqlite::types::{Value as EngineValue, ValueRef};
use serde::Serialize;
use std::str::FromStr;
use std::sync::LazyLock;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap_or_else(|_| unreachable!())
});

/// Whether `name` matches the identifier grammar (letter or underscore, then
/// letters, digits or underscores)
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Validate an identifier or parameter name, raising `ParameterError` otherwise
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DbError::parameter("Identifier cannot be empty"));
    }
    if !is_valid_identifier(name) {
        return Err(DbError::parameter(format!("Invalid identifier: {}", name)));
    }
    Ok(())
}

/// Quote a validated identifier for use in SQL text
pub fn quote_identifier(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name))
}

/// A value sent to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Decimal(Decimal),
    Timestamp(DateTime<Utc>),
    List(Vec<Param>),
}

impl Param {
    /// Convert into an engine value
    ///
    /// Decimals bind as floating point since the engine has no exact numeric
    /// binding; timestamps bind as RFC 3339 text; lists bind as JSON array
    /// text after element-wise conversion.
    pub fn to_engine(&self) -> Result<EngineValue> {
        Ok(match self {
            Param::Null => EngineValue::Null,
            Param::Bool(v) => EngineValue::Integer(i64::from(*v)),
            Param::Integer(v) => EngineValue::Integer(*v),
            Param::Real(v) => {
                if !v.is_finite() {
                    return Err(DbError::parameter(format!(
                        "Cannot bind non-finite number: {}",
                        v
                    )));
                }
                EngineValue::Real(*v)
            }
            Param::Text(v) => EngineValue::Text(v.clone()),
            Param::Blob(v) => EngineValue::Blob(v.clone()),
            Param::Decimal(v) => match v.to_f64() {
                Some(f) if f.is_finite() => EngineValue::Real(f),
                _ => {
                    return Err(DbError::parameter(format!(
                        "Cannot convert decimal {} to a floating point value",
                        v
                    )))
                }
            },
            Param::Timestamp(v) => EngineValue::Text(format_timestamp(v)),
            Param::List(items) => {
                let converted = items
                    .iter()
                    .map(|item| item.to_engine().and_then(engine_to_json))
                    .collect::<Result<Vec<_>>>()?;
                let json = serde_json::to_string(&converted).map_err(|e| {
                    DbError::parameter(format!("Cannot encode list parameter: {}", e))
                })?;
                EngineValue::Text(json)
            }
        })
    }

    /// Render as a SQL literal
    pub fn to_sql_literal(&self) -> Result<String> {
        Ok(match self {
            Param::Null => "NULL".to_string(),
            Param::Bool(true) => "TRUE".to_string(),
            Param::Bool(false) => "FALSE".to_string(),
            Param::Integer(v) => v.to_string(),
            Param::Real(v) => {
                if !v.is_finite() {
                    return Err(DbError::parameter(format!(
                        "Cannot format non-finite number: {}",
                        v
                    )));
                }
                v.to_string()
            }
            Param::Text(v) => format!("'{}'", v.replace('\'', "''")),
            Param::Blob(v) => {
                let hex: String = v.iter().map(|b| format!("{:02X}", b)).collect();
                format!("X'{}'", hex)
            }
            Param::Decimal(v) => v.to_string(),
            Param::Timestamp(v) => format!("'{}'", format_timestamp(v)),
            Param::List(items) => {
                let parts = items
                    .iter()
                    .map(Param::to_sql_literal)
                    .collect::<Result<Vec<_>>>()?;
                format!("({})", parts.join(", "))
            }
        })
    }
}

fn engine_to_json(value: EngineValue) -> Result<serde_json::Value> {
    Ok(match value {
        EngineValue::Null => serde_json::Value::Null,
        EngineValue::Integer(v) => serde_json::Value::from(v),
        EngineValue::Real(v) => serde_json::Number::from_f64(v)
            .map(serde_json::Value::Number)
            .ok_or_else(|| DbError::parameter(format!("Cannot encode number: {}", v)))?,
        EngineValue::Text(v) => serde_json::Value::String(v),
        EngineValue::Blob(_) => {
            return Err(DbError::parameter("Cannot encode binary data inside a list"))
        }
    })
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl From<bool> for Param {
    fn from(v: bool) -> Self {
        Param::Bool(v)
    }
}

impl From<i32> for Param {
    fn from(v: i32) -> Self {
        Param::Integer(i64::from(v))
    }
}

impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Param::Integer(v)
    }
}

impl From<u32> for Param {
    fn from(v: u32) -> Self {
        Param::Integer(i64::from(v))
    }
}

impl From<f64> for Param {
    fn from(v: f64) -> Self {
        Param::Real(v)
    }
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Param::Text(v.to_string())
    }
}

impl From<String> for Param {
    fn from(v: String) -> Self {
        Param::Text(v)
    }
}

impl From<&String> for Param {
    fn from(v: &String) -> Self {
        Param::Text(v.clone())
    }
}

impl From<Decimal> for Param {
    fn from(v: Decimal) -> Self {
        Param::Decimal(v)
    }
}

impl From<DateTime<Utc>> for Param {
    fn from(v: DateTime<Utc>) -> Self {
        Param::Timestamp(v)
    }
}

impl From<NaiveDateTime> for Param {
    fn from(v: NaiveDateTime) -> Self {
        Param::Timestamp(v.and_utc())
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Param::Null)
    }
}

impl<T: Into<Param>> From<Vec<T>> for Param {
    fn from(v: Vec<T>) -> Self {
        Param::List(v.into_iter().map(Into::into).collect())
    }
}

/// Parameters for one statement
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Params {
    #[default]
    None,
    /// Bound in order to `?` / `?N` placeholders
    Positional(Vec<Param>),
    /// Bound by name to `$name`, `:name` or `@name` placeholders
    Named(Vec<(String, Param)>),
}

impl Params {
    pub fn positional<I, P>(values: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Param>,
    {
        Params::Positional(values.into_iter().map(Into::into).collect())
    }

    pub fn named<I, K, P>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, P)>,
        K: Into<String>,
        P: Into<Param>,
    {
        Params::Named(
            values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Params::None => true,
            Params::Positional(values) => values.is_empty(),
            Params::Named(values) => values.is_empty(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Params::None => 0,
            Params::Positional(values) => values.len(),
            Params::Named(values) => values.len(),
        }
    }
}

/// A value read back from the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Decimal(Decimal),
    Text(String),
    Timestamp(DateTime<Utc>),
    Blob(Vec<u8>),
}

impl Value {
    /// Convert an engine value
    ///
    /// Floating point results become decimals (exact base-10 values take
    /// priority over native floats); text that looks like a timestamp is
    /// parsed, falling back to the raw text.
    pub fn from_engine(value: ValueRef<'_>) -> Result<Value> {
        Ok(match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(v) => Value::Integer(v),
            ValueRef::Real(v) => Value::Decimal(float_to_decimal(v)?),
            ValueRef::Text(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    DbError::query(FailureKind::Conversion, format!("Invalid UTF-8 text: {}", e))
                })?;
                if looks_like_datetime(text) {
                    match parse_datetime(text) {
                        Some(ts) => Value::Timestamp(ts),
                        None => Value::Text(text.to_string()),
                    }
                } else {
                    Value::Text(text.to_string())
                }
            }
            ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            Value::Decimal(v) if v.fract().is_zero() => v.to_i64(),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Decimal(v) => Some(*v),
            Value::Integer(v) => Some(Decimal::from(*v)),
            Value::Text(v) => Decimal::from_str(v).ok(),
            _ => None,
        }
    }

    /// Booleans are stored as integers
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Integer(0) => Some(false),
            Value::Integer(1) => Some(true),
            Value::Text(v) => match v.to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Text form of the value, timestamps in RFC 3339
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Integer(v) => Some(v.to_string()),
            Value::Decimal(v) => Some(v.to_string()),
            Value::Text(v) => Some(v.clone()),
            Value::Timestamp(v) => Some(format_timestamp(v)),
            Value::Blob(v) => Some(format!("<{} bytes>", v.len())),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_text() {
            Some(text) => write!(f, "{}", text),
            None => write!(f, "NULL"),
        }
    }
}

fn float_to_decimal(v: f64) -> Result<Decimal> {
    if !v.is_finite() {
        return Err(DbError::query(
            FailureKind::Conversion,
            format!("Cannot represent {} as a decimal", v),
        ));
    }
    // shortest round-trip text keeps 123.45 as 123.45 instead of its binary expansion
    let decimal = Decimal::from_str(&v.to_string())
        .ok()
        .or_else(|| Decimal::from_f64(v))
        .ok_or_else(|| {
            DbError::query(
                FailureKind::Conversion,
                format!("Cannot represent {} as a decimal", v),
            )
        })?;

    // digits past the 28-place scale are rounded away, so 1e-30 would read back as 0
    match decimal.to_f64() {
        Some(back) if (back - v).abs() <= v.abs() * f64::EPSILON * 4.0 => Ok(decimal),
        _ => Err(DbError::query(
            FailureKind::Conversion,
            format!("{} loses precision as a decimal ({})", v, decimal),
        )),
    }
}

/// Cheap pre-check before attempting a timestamp parse
fn looks_like_datetime(value: &str) -> bool {
    value.len() >= 10
        && value.contains('-')
        && (value.contains('T') || value.contains(':') || has_spaced_time(value))
}

/// A space followed by a digit, as in `2024-03-01 14:30`
fn has_spaced_time(value: &str) -> bool {
    value
        .as_bytes()
        .windows(2)
        .any(|pair| pair[0] == b' ' && pair[1].is_ascii_digit())
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .map(|ts| ts.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_identifier_grammar() {
        assert!(is_valid_identifier("symbol"));
        assert!(is_valid_identifier("_private"));
        assert!(is_valid_identifier("col_2"));
        assert!(!is_valid_identifier("2col"));
        assert!(!is_valid_identifier("drop table"));
        assert!(!is_valid_identifier("a;b"));
        assert!(!is_valid_identifier("name\""));
        assert!(!is_valid_identifier(""));
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("assets").unwrap(), "\"assets\"");
        assert!(matches!(
            quote_identifier("assets; DROP TABLE x"),
            Err(DbError::Parameter(_))
        ));
        assert!(matches!(quote_identifier(""), Err(DbError::Parameter(_))));
    }

    #[test]
    fn test_outbound_primitives() {
        assert_eq!(Param::Null.to_engine().unwrap(), EngineValue::Null);
        assert_eq!(Param::Bool(true).to_engine().unwrap(), EngineValue::Integer(1));
        assert_eq!(Param::from(42).to_engine().unwrap(), EngineValue::Integer(42));
        assert_eq!(
            Param::from("abc").to_engine().unwrap(),
            EngineValue::Text("abc".to_string())
        );
        assert_eq!(Param::from(None::<i64>), Param::Null);
    }

    #[test]
    fn test_outbound_decimal_and_timestamp() {
        assert_eq!(
            Param::from(dec("123.45")).to_engine().unwrap(),
            EngineValue::Real(123.45)
        );

        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap();
        assert_eq!(
            Param::from(ts).to_engine().unwrap(),
            EngineValue::Text("2024-03-01T14:30:00.000000Z".to_string())
        );
    }

    #[test]
    fn test_outbound_list_converts_elementwise() {
        let list = Param::List(vec![
            Param::from(1),
            Param::from(dec("2.5")),
            Param::from("x"),
            Param::Null,
        ]);
        assert_eq!(
            list.to_engine().unwrap(),
            EngineValue::Text("[1,2.5,\"x\",null]".to_string())
        );
    }

    #[test]
    fn test_outbound_rejects_unconvertible() {
        assert!(matches!(
            Param::Real(f64::NAN).to_engine(),
            Err(DbError::Parameter(_))
        ));
        assert!(matches!(
            Param::List(vec![Param::Blob(vec![1, 2])]).to_engine(),
            Err(DbError::Parameter(_))
        ));
    }

    #[test]
    fn test_inbound_float_becomes_decimal() {
        assert_eq!(
            Value::from_engine(ValueRef::Real(123.45)).unwrap(),
            Value::Decimal(dec("123.45"))
        );
        assert_eq!(
            Value::from_engine(ValueRef::Real(0.1)).unwrap(),
            Value::Decimal(dec("0.1"))
        );
        assert!(Value::from_engine(ValueRef::Real(f64::INFINITY)).is_err());
    }

    #[test]
    fn test_inbound_float_below_decimal_scale_is_rejected() {
        for tiny in [1e-30, -2.5e-29, 1.234567890123e-20] {
            let err = Value::from_engine(ValueRef::Real(tiny)).unwrap_err();
            assert_eq!(err.failure_kind(), Some(FailureKind::Conversion), "{}", tiny);
        }
        assert_eq!(
            Value::from_engine(ValueRef::Real(0.0)).unwrap(),
            Value::Decimal(Decimal::ZERO)
        );
        assert_eq!(
            Value::from_engine(ValueRef::Real(1e-20)).unwrap(),
            Value::Decimal(dec("0.00000000000000000001"))
        );
    }

    #[test]
    fn test_decimal_round_trip() {
        for text in ["123.45", "0.000001", "99999999.99", "-42.5", "1"] {
            let original = Decimal::from_str(text).unwrap();
            let engine = Param::Decimal(original).to_engine().unwrap();
            let back = match engine {
                EngineValue::Real(f) => Value::from_engine(ValueRef::Real(f)).unwrap(),
                other => panic!("unexpected engine value {:?}", other),
            };
            assert_eq!(back.as_decimal(), Some(original), "round trip of {}", text);
        }
    }

    #[test]
    fn test_inbound_datetime_heuristic() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap();
        for text in [
            "2024-03-01T14:30:00Z",
            "2024-03-01T14:30:00+00:00",
            "2024-03-01 14:30:00",
            "2024-03-01T14:30:00.000000Z",
        ] {
            let value = Value::from_engine(ValueRef::Text(text.as_bytes())).unwrap();
            assert_eq!(value, Value::Timestamp(expected), "parsing {}", text);
        }

        let with_offset =
            Value::from_engine(ValueRef::Text(b"2024-03-01T16:30:00+02:00")).unwrap();
        assert_eq!(with_offset, Value::Timestamp(expected));
    }

    #[test]
    fn test_inbound_text_falls_back() {
        // too short, no time separator, or unparsable
        for text in [
            "1.0.0",
            "2024-03-01",
            "2024-03-01 ",
            "2024-03-01 close",
            "not-a-date: really",
            "AAPL",
        ] {
            let value = Value::from_engine(ValueRef::Text(text.as_bytes())).unwrap();
            assert_eq!(value, Value::Text(text.to_string()));
        }
    }

    #[test]
    fn test_sql_literals() {
        assert_eq!(Param::Null.to_sql_literal().unwrap(), "NULL");
        assert_eq!(Param::Bool(false).to_sql_literal().unwrap(), "FALSE");
        assert_eq!(Param::from("O'Brien").to_sql_literal().unwrap(), "'O''Brien'");
        assert_eq!(Param::from(dec("10.50")).to_sql_literal().unwrap(), "10.50");
        assert_eq!(Param::Blob(vec![0xDE, 0xAD]).to_sql_literal().unwrap(), "X'DEAD'");
        assert_eq!(
            Param::from(vec![1, 2, 3]).to_sql_literal().unwrap(),
            "(1, 2, 3)"
        );
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::Integer(1).as_bool(), Some(true));
        assert_eq!(Value::Integer(0).as_bool(), Some(false));
        assert_eq!(Value::Integer(7).as_decimal(), Some(Decimal::from(7)));
        assert_eq!(Value::Decimal(dec("3.0")).as_i64(), Some(3));
        assert_eq!(Value::Text("x".to_string()).as_str(), Some("x"));
        assert!(Value::Null.is_null());
        assert_eq!(Value::Null.to_string(), "NULL");
    }
}
