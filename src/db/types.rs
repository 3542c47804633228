//! Decoding of driver rows into JSON rows.
//!
//! Column types are first sorted into a [`TypeCategory`]; a per-driver
//! decoder then extracts the value. Values that cannot be decoded become
//! `null` rather than failing the whole fetch.

use crate::models::{DatabaseType, Row};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row as _, Type, TypeInfo};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Binary,
    Json,
    Text,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Checked before floats since "numeric" overlaps
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC affinity stores floats
        if db == DatabaseType::SQLite {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("int") || lower.contains("serial") {
        return TypeCategory::Integer;
    }

    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    TypeCategory::Text
}

/// MySQL DECIMAL as its exact text representation.
#[derive(Debug)]
struct RawDecimal(String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn bytes_value(bytes: &[u8]) -> JsonValue {
    JsonValue::String(STANDARD.encode(bytes))
}

/// Text columns named like JSON are parsed when possible.
fn text_value(text: String, type_name: &str) -> JsonValue {
    if type_name.to_lowercase().contains("json") {
        if let Ok(json) = serde_json::from_str::<JsonValue>(&text) {
            return json;
        }
    }
    JsonValue::String(text)
}

/// Conversion of a driver row into a [`Row`].
pub trait RowToJson {
    fn to_json_map(&self) -> Row;

    fn column_names(&self) -> Vec<String>;
}

macro_rules! impl_row_to_json {
    ($row:ty, $db:expr, $decoder:path) => {
        impl RowToJson for $row {
            fn to_json_map(&self) -> Row {
                self.columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| {
                        let type_name = col.type_info().name();
                        let category = categorize_type(type_name, $db);
                        (
                            col.name().to_string(),
                            $decoder(self, idx, type_name, category),
                        )
                    })
                    .collect()
            }

            fn column_names(&self) -> Vec<String> {
                self.columns()
                    .iter()
                    .map(|col| col.name().to_string())
                    .collect()
            }
        }
    };
}

impl_row_to_json!(MySqlRow, DatabaseType::MySQL, mysql::decode_column);
impl_row_to_json!(PgRow, DatabaseType::PostgreSQL, postgres::decode_column);
impl_row_to_json!(SqliteRow, DatabaseType::SQLite, sqlite::decode_column);

mod mysql {
    use super::*;

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> JsonValue {
        match category {
            TypeCategory::Decimal => match row.try_get::<Option<RawDecimal>, _>(idx) {
                Ok(v) => v.map(|d| JsonValue::String(d.0)).unwrap_or(JsonValue::Null),
                Err(e) => {
                    tracing::debug!(column = idx, error = %e, "Failed to decode DECIMAL");
                    JsonValue::Null
                }
            },
            TypeCategory::Integer => integer(row, idx),
            TypeCategory::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map(JsonValue::Bool)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Float => float(row, idx),
            TypeCategory::Binary => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map(|v| bytes_value(&v))
                .unwrap_or(JsonValue::Null),
            TypeCategory::Json => row
                .try_get::<Option<JsonValue>, _>(idx)
                .ok()
                .flatten()
                .unwrap_or(JsonValue::Null),
            TypeCategory::Text => row
                .try_get::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .map(|v| text_value(v, type_name))
                .unwrap_or(JsonValue::Null),
        }
    }

    fn integer(row: &MySqlRow, idx: usize) -> JsonValue {
        // Signed widths first, then unsigned; sqlx only decodes exact widths.
        macro_rules! try_width {
            ($($t:ty),+) => {
                $(
                    if let Ok(Some(v)) = row.try_get::<Option<$t>, _>(idx) {
                        return JsonValue::Number(v.into());
                    }
                )+
            };
        }
        try_width!(i64, i32, i16, i8, u64, u32, u16, u8);
        JsonValue::Null
    }

    fn float(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return float_value(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return float_value(v.into());
        }
        JsonValue::Null
    }
}

mod postgres {
    use super::*;

    /// NUMERIC arrives in binary form and decodes to `null`; cast it to
    /// `text` in the query to read it.
    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> JsonValue {
        match category {
            TypeCategory::Integer => {
                if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
                    return JsonValue::Number(v.into());
                }
                if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
                    return JsonValue::Number(v.into());
                }
                if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
                    return JsonValue::Number(v.into());
                }
                JsonValue::Null
            }
            TypeCategory::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map(JsonValue::Bool)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Float => {
                if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
                    return float_value(v);
                }
                if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
                    return float_value(v.into());
                }
                JsonValue::Null
            }
            TypeCategory::Binary => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map(|v| bytes_value(&v))
                .unwrap_or(JsonValue::Null),
            TypeCategory::Json => row
                .try_get::<Option<JsonValue>, _>(idx)
                .ok()
                .flatten()
                .unwrap_or(JsonValue::Null),
            TypeCategory::Decimal | TypeCategory::Text => {
                match row.try_get::<Option<String>, _>(idx) {
                    Ok(v) => v.map(|s| text_value(s, type_name)).unwrap_or(JsonValue::Null),
                    Err(e) => {
                        tracing::debug!(column = idx, type_name, error = %e, "Column not decodable as text");
                        JsonValue::Null
                    }
                }
            }
        }
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> JsonValue {
        match category {
            TypeCategory::Integer => row
                .try_get::<Option<i64>, _>(idx)
                .ok()
                .flatten()
                .map(|v| JsonValue::Number(v.into()))
                .unwrap_or(JsonValue::Null),
            TypeCategory::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map(JsonValue::Bool)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Float | TypeCategory::Decimal => row
                .try_get::<Option<f64>, _>(idx)
                .ok()
                .flatten()
                .map(float_value)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Binary => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map(|v| bytes_value(&v))
                .unwrap_or(JsonValue::Null),
            TypeCategory::Json | TypeCategory::Text => dynamic(row, idx, type_name),
        }
    }

    /// Expression columns and untyped values report their storage class
    /// ("INTEGER", "TEXT", "NULL") only at runtime.
    fn dynamic(row: &SqliteRow, idx: usize, type_name: &str) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
            return text_value(v, type_name);
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return float_value(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return bytes_value(&v);
        }
        JsonValue::Null
    }
}
