//! `sql.{query,mutate,raw}` capability: a `sqlx::Any` pool bound per service
//! at deploy time (§4.4). Statement length and bind-parameter count are
//! capped in code before the statement ever reaches the driver.

use async_trait::async_trait;
use serde_json::{Value, json};
use sqlx::{Any, AnyPool, Column, Row, ValueRef, any::AnyValueKind};

use crate::{
    error::{Error, Result},
    host::{
        capability::{Capability, CapabilityOutcome},
        policy::{PolicyContext, check_size_limit, invalid_params},
    },
};

const MAX_STATEMENT_BYTES: usize = 64 * 1024;
const MAX_BIND_PARAMS: usize = 256;

pub struct SqlCapability {
    pool: AnyPool,
}

impl SqlCapability {
    #[must_use]
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    fn parse_statement(params: &Value) -> Result<(&str, Vec<Value>)> {
        let statement = params
            .get("statement")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid_params("`statement` is required"))?;
        check_size_limit(statement.len(), MAX_STATEMENT_BYTES)?;
        let binds = params
            .get("params")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if binds.len() > MAX_BIND_PARAMS {
            return Err(invalid_params(format!(
                "too many bind parameters ({} > {MAX_BIND_PARAMS})",
                binds.len()
            )));
        }
        Ok((statement, binds))
    }

    fn bind<'q>(
        mut query: sqlx::query::Query<'q, Any, <Any as sqlx::Database>::Arguments<'q>>,
        binds: &'q [Value],
    ) -> Result<sqlx::query::Query<'q, Any, <Any as sqlx::Database>::Arguments<'q>>> {
        for value in binds {
            query = match value {
                Value::Null => query.bind(None::<String>),
                Value::Bool(b) => query.bind(*b),
                Value::Number(n) if n.is_i64() => query.bind(n.as_i64()),
                Value::Number(n) if n.is_f64() => query.bind(n.as_f64()),
                Value::String(s) => query.bind(s.clone()),
                other => return Err(invalid_params(format!("unsupported bind value `{other}`"))),
            };
        }
        Ok(query)
    }

    fn row_to_json(row: &sqlx::any::AnyRow) -> serde_json::Map<String, Value> {
        let mut obj = serde_json::Map::new();
        for (idx, column) in row.columns().iter().enumerate() {
            let value = match row.try_get_raw(idx) {
                Ok(raw) if !raw.is_null() => match raw.kind() {
                    AnyValueKind::Text(s) => json!(s),
                    AnyValueKind::BigInt(i) => json!(i),
                    AnyValueKind::Integer(i) => json!(i),
                    AnyValueKind::Double(d) => json!(d),
                    AnyValueKind::Bool(b) => json!(b),
                    AnyValueKind::Blob(b) => json!(b),
                    _ => Value::Null,
                },
                _ => Value::Null,
            };
            obj.insert(column.name().to_string(), value);
        }
        obj
    }
}

#[async_trait]
impl Capability for SqlCapability {
    fn name(&self) -> &'static str {
        "sql"
    }

    async fn call(&self, method: &str, params: Value, _ctx: &PolicyContext) -> Result<CapabilityOutcome> {
        let (statement, binds) = Self::parse_statement(&params)?;

        match method {
            "query" | "raw" => {
                let query = Self::bind(sqlx::query(statement), &binds)?;
                let rows = query.fetch_all(&self.pool).await.map_err(Error::external)?;
                let rows: Vec<Value> = rows.iter().map(|r| Value::Object(Self::row_to_json(r))).collect();
                Ok(json!({ "rows": rows }).into())
            }
            "mutate" => {
                let query = Self::bind(sqlx::query(statement), &binds)?;
                let result = query.execute(&self.pool).await.map_err(Error::external)?;
                Ok(json!({ "rows_affected": result.rows_affected() }).into())
            }
            other => Err(invalid_params(format!("unknown sql verb `{other}`"))),
        }
    }
}
