//! Common value and row types shared by the connection layer

use crate::errors::DatabaseError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Query parameter / column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryValue {
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	String(String),
	Bytes(Vec<u8>),
	Timestamp(chrono::DateTime<chrono::Utc>),
	Uuid(Uuid),
}

impl From<&str> for QueryValue {
	fn from(s: &str) -> Self {
		QueryValue::String(s.to_string())
	}
}

impl From<String> for QueryValue {
	fn from(s: String) -> Self {
		QueryValue::String(s)
	}
}

impl From<i64> for QueryValue {
	fn from(i: i64) -> Self {
		QueryValue::Int(i)
	}
}

impl From<i32> for QueryValue {
	fn from(i: i32) -> Self {
		QueryValue::Int(i as i64)
	}
}

impl From<f64> for QueryValue {
	fn from(f: f64) -> Self {
		QueryValue::Float(f)
	}
}

impl From<bool> for QueryValue {
	fn from(b: bool) -> Self {
		QueryValue::Bool(b)
	}
}

impl From<chrono::DateTime<chrono::Utc>> for QueryValue {
	fn from(dt: chrono::DateTime<chrono::Utc>) -> Self {
		QueryValue::Timestamp(dt)
	}
}

impl From<Uuid> for QueryValue {
	fn from(u: Uuid) -> Self {
		QueryValue::Uuid(u)
	}
}

/// Result of a write statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
	pub rows_affected: u64,
}

/// Row from a query result.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
	pub data: HashMap<String, QueryValue>,
}

impl Row {
	pub fn new() -> Self {
		Self {
			data: HashMap::new(),
		}
	}

	pub fn insert(&mut self, key: String, value: QueryValue) {
		self.data.insert(key, value);
	}

	pub fn get<T: TryFrom<QueryValue>>(&self, key: &str) -> Result<T, DatabaseError>
	where
		DatabaseError: From<<T as TryFrom<QueryValue>>::Error>,
	{
		self.data
			.get(key)
			.cloned()
			.ok_or_else(|| DatabaseError::ColumnNotFound(key.to_string()))
			.and_then(|v| v.try_into().map_err(Into::into))
	}
}

impl TryFrom<QueryValue> for i64 {
	type Error = DatabaseError;

	fn try_from(value: QueryValue) -> Result<Self, Self::Error> {
		match value {
			QueryValue::Int(v) => Ok(v),
			other => Err(DatabaseError::TypeConversion(format!(
				"expected integer, got {other:?}"
			))),
		}
	}
}

impl TryFrom<QueryValue> for f64 {
	type Error = DatabaseError;

	fn try_from(value: QueryValue) -> Result<Self, Self::Error> {
		match value {
			QueryValue::Float(v) => Ok(v),
			QueryValue::Int(v) => Ok(v as f64),
			other => Err(DatabaseError::TypeConversion(format!(
				"expected float, got {other:?}"
			))),
		}
	}
}

impl TryFrom<QueryValue> for String {
	type Error = DatabaseError;

	fn try_from(value: QueryValue) -> Result<Self, Self::Error> {
		match value {
			QueryValue::String(v) => Ok(v),
			other => Err(DatabaseError::TypeConversion(format!(
				"expected string, got {other:?}"
			))),
		}
	}
}

impl TryFrom<QueryValue> for bool {
	type Error = DatabaseError;

	fn try_from(value: QueryValue) -> Result<Self, Self::Error> {
		match value {
			QueryValue::Bool(v) => Ok(v),
			QueryValue::Int(v) => Ok(v != 0),
			other => Err(DatabaseError::TypeConversion(format!(
				"expected boolean, got {other:?}"
			))),
		}
	}
}

impl TryFrom<QueryValue> for Vec<u8> {
	type Error = DatabaseError;

	fn try_from(value: QueryValue) -> Result<Self, Self::Error> {
		match value {
			QueryValue::Bytes(v) => Ok(v),
			other => Err(DatabaseError::TypeConversion(format!(
				"expected bytes, got {other:?}"
			))),
		}
	}
}

/// One entry of the per-checkout query log.
///
/// `duration` is `None` for statements captured while pretending, which are
/// logged but never sent to the database.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryLogEntry {
	pub sql: String,
	pub bindings: Vec<QueryValue>,
	pub duration: Option<Duration>,
}
