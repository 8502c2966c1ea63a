//! Query building blocks: predicates, paging, projections and the derived
//! query resolver.
//!
//! # Responsibility
//! - Build pure, composable query inputs over typed entity paths.
//! - Resolve query descriptors into validated plans once, at registration.
//!
//! # Invariants
//! - Nothing here talks to storage except plan registration, which only
//!   prepares native SQL to validate it.
//! - Identifiers rendered into SQL always come from static entity metadata,
//!   never from argument values; values are always bound.

pub mod descriptor;
pub mod page;
pub mod predicate;
pub mod projection;
pub mod resolver;
pub(crate) mod sql;
pub mod update;

use rusqlite::types::Value;

/// Comparison operators supported by predicates and query descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparator {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    IsNull,
    IsNotNull,
}

impl Comparator {
    /// Whether the comparator binds an argument.
    pub fn takes_argument(self) -> bool {
        !matches!(self, Self::IsNull | Self::IsNotNull)
    }

    pub(crate) fn keyword(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::In => "IN",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
        }
    }
}

/// Conversion of Rust values into bindable SQLite values.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::Text(self.to_string())
    }
}

impl IntoValue for String {
    fn into_value(self) -> Value {
        Value::Text(self)
    }
}

impl IntoValue for &String {
    fn into_value(self) -> Value {
        Value::Text(self.clone())
    }
}

impl IntoValue for i64 {
    fn into_value(self) -> Value {
        Value::Integer(self)
    }
}

impl IntoValue for i32 {
    fn into_value(self) -> Value {
        Value::Integer(i64::from(self))
    }
}

impl IntoValue for u32 {
    fn into_value(self) -> Value {
        Value::Integer(i64::from(self))
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Value {
        Value::Integer(i64::from(self))
    }
}

impl IntoValue for f64 {
    fn into_value(self) -> Value {
        Value::Real(self)
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        self.map_or(Value::Null, IntoValue::into_value)
    }
}
