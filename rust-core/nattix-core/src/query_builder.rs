//! # Query Builder
//!
//! Fluent SQL construction over one table. Every method first checks that it
//! may follow the builder's current [`Step`]; an illegal sequence fails with
//! `QueryOrder` and leaves the builder untouched.
//!
//! Values are never interpolated. Each one is recorded under a named
//! placeholder (`:column`, `:column_2`, ...) and bound by [`Database::query`]
//! when the statement runs.
//!
//! ```ignore
//! let mut users = db.table("users")?;
//! let rows = users
//!     .select(&["id", "name"])?
//!     .where_eq("active", true)?
//!     .order_by("name", "ASC")?
//!     .limit(10)?
//!     .get(&db)
//!     .await?;
//! ```

use crate::database::{Backend, Database, QueryParams, QueryResult, Row};
use crate::error::{Error, Result};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tracing::debug;

/// Position of the builder in its state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing chosen yet
    Initial,
    /// `select`
    Select,
    /// `insert`
    Insert,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `where_*`, `or_where`, `subquery`
    Where,
    /// Any join
    Join,
    /// `count` or an aggregate
    Count,
    /// `order_by`
    Order,
    /// `group_by` / `having`
    Group,
    /// `limit`
    Limit,
    /// `offset`
    Offset,
    /// `distinct`
    Distinct,
    /// `truncate`
    Truncate,
    /// `union`
    Union,
    /// `raw_query`
    Raw,
    /// `between`
    Between,
}

impl Step {
    /// Lowercase name used in error messages
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Where => "where",
            Self::Join => "join",
            Self::Count => "count",
            Self::Order => "order_by",
            Self::Group => "group_by",
            Self::Limit => "limit",
            Self::Offset => "offset",
            Self::Distinct => "distinct",
            Self::Truncate => "truncate",
            Self::Union => "union",
            Self::Raw => "raw_query",
            Self::Between => "between",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const STATEMENT_START: &[Step] = &[Step::Initial];
const FILTERABLE: &[Step] = &[
    Step::Select,
    Step::Distinct,
    Step::Count,
    Step::Update,
    Step::Delete,
    Step::Join,
    Step::Where,
    Step::Between,
];
const CHAINED_FILTER: &[Step] = &[Step::Where, Step::Between];
const JOINABLE: &[Step] = &[Step::Select, Step::Distinct, Step::Count, Step::Join];
const ALIASABLE: &[Step] = &[Step::Select, Step::Distinct, Step::Count];
const GROUPABLE: &[Step] = &[
    Step::Select,
    Step::Distinct,
    Step::Count,
    Step::Join,
    Step::Where,
    Step::Between,
];
const HAVING: &[Step] = &[Step::Group];
const ORDERABLE: &[Step] = &[
    Step::Select,
    Step::Distinct,
    Step::Join,
    Step::Where,
    Step::Between,
    Step::Group,
    Step::Order,
    Step::Union,
];
const LIMITABLE: &[Step] = &[
    Step::Select,
    Step::Distinct,
    Step::Join,
    Step::Where,
    Step::Between,
    Step::Group,
    Step::Order,
    Step::Union,
];
const OFFSETTABLE: &[Step] = &[Step::Limit];
const UNIONABLE: &[Step] = &[
    Step::Select,
    Step::Distinct,
    Step::Join,
    Step::Where,
    Step::Between,
    Step::Group,
    Step::Union,
];

const OPERATORS: &[&str] = &["=", "!=", "<>", "<", ">", "<=", ">=", "LIKE", "NOT LIKE"];

/// Aggregate function for [`QueryBuilder::aggregate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    /// `SUM(col) AS total`
    Sum,
    /// `AVG(col) AS average`
    Avg,
    /// `MIN(col) AS min_value`
    Min,
    /// `MAX(col) AS max_value`
    Max,
}

impl Aggregate {
    const fn sql(self) -> (&'static str, &'static str) {
        match self {
            Self::Sum => ("SUM", "total"),
            Self::Avg => ("AVG", "average"),
            Self::Min => ("MIN", "min_value"),
            Self::Max => ("MAX", "max_value"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Statement {
    None,
    Select { columns: String, distinct: bool },
    Insert { columns: Vec<String>, placeholders: Vec<String> },
    Update { assignments: Vec<String> },
    Delete,
    Truncate,
    Raw(String),
}

/// One page of rows from [`QueryBuilder::paginate`]
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    /// Rows of the requested page
    pub data: Vec<Row>,
    /// Rows matching the query across all pages
    pub total: i64,
    /// Page size
    pub per_page: u64,
    /// 1-based page number
    pub current_page: u64,
    /// Number of pages (`ceil(total / per_page)`)
    pub total_pages: u64,
}

/// Fluent, order-checked SQL builder
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    table: String,
    alias: Option<String>,
    step: Step,
    statement: Statement,
    joins: Vec<String>,
    conditions: Vec<String>,
    groups: Vec<String>,
    having: Vec<String>,
    unions: Vec<String>,
    orders: Vec<String>,
    limit: Option<u64>,
    offset: Option<u64>,
    binds: QueryParams,
}

impl QueryBuilder {
    /// Builder over `table`
    ///
    /// # Errors
    ///
    /// `QueryArgument` when the table name is not a plain identifier.
    pub fn new(table: &str) -> Result<Self> {
        validate_table(table)?;
        Ok(Self {
            table: table.to_string(),
            alias: None,
            step: Step::Initial,
            statement: Statement::None,
            joins: Vec::new(),
            conditions: Vec::new(),
            groups: Vec::new(),
            having: Vec::new(),
            unions: Vec::new(),
            orders: Vec::new(),
            limit: None,
            offset: None,
            binds: QueryParams::new(),
        })
    }

    /// Table the builder works on
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Current state
    #[must_use]
    pub const fn step(&self) -> Step {
        self.step
    }

    /// Values bound so far, by placeholder name
    #[must_use]
    pub const fn params(&self) -> &QueryParams {
        &self.binds
    }

    fn guard(&self, method: &'static str, allowed: &[Step]) -> Result<()> {
        if allowed.contains(&self.step) {
            Ok(())
        } else {
            Err(Error::QueryOrder {
                method,
                step: self.step.as_str(),
            })
        }
    }

    /// `SELECT cols`; an empty slice selects `*`
    ///
    /// # Errors
    ///
    /// `QueryOrder` unless the builder is fresh; `QueryArgument` for a bad
    /// column.
    pub fn select(&mut self, columns: &[&str]) -> Result<&mut Self> {
        self.guard("select", STATEMENT_START)?;
        let columns = column_list(columns)?;
        self.statement = Statement::Select {
            columns,
            distinct: false,
        };
        self.step = Step::Select;
        Ok(self)
    }

    /// `SELECT DISTINCT cols`
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::select`].
    pub fn distinct(&mut self, columns: &[&str]) -> Result<&mut Self> {
        self.guard("distinct", STATEMENT_START)?;
        let columns = column_list(columns)?;
        self.statement = Statement::Select {
            columns,
            distinct: true,
        };
        self.step = Step::Distinct;
        Ok(self)
    }

    /// `SELECT COUNT(col) AS count`; `None` counts rows
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::select`].
    pub fn count(&mut self, column: Option<&str>) -> Result<&mut Self> {
        self.guard("count", STATEMENT_START)?;
        let target = match column {
            Some(column) => {
                validate_column(column)?;
                column
            }
            None => "*",
        };
        self.statement = Statement::Select {
            columns: format!("COUNT({target}) AS count"),
            distinct: false,
        };
        self.step = Step::Count;
        Ok(self)
    }

    /// `SELECT SUM|AVG|MIN|MAX(col)`
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::select`].
    pub fn aggregate(&mut self, kind: Aggregate, column: &str) -> Result<&mut Self> {
        self.guard("aggregate", STATEMENT_START)?;
        validate_column(column)?;
        let (function, alias) = kind.sql();
        self.statement = Statement::Select {
            columns: format!("{function}({column}) AS {alias}"),
            distinct: false,
        };
        self.step = Step::Count;
        Ok(self)
    }

    /// `INSERT INTO table (...) VALUES (...)`
    ///
    /// # Errors
    ///
    /// `QueryOrder` unless the builder is fresh; `QueryArgument` for empty
    /// data or a bad column.
    pub fn insert(&mut self, data: &QueryParams) -> Result<&mut Self> {
        self.guard("insert", STATEMENT_START)?;
        if data.is_empty() {
            return Err(Error::query_argument("insert needs at least one column"));
        }
        for column in data.keys() {
            validate_identifier(column)?;
        }

        let mut columns = Vec::with_capacity(data.len());
        let mut placeholders = Vec::with_capacity(data.len());
        for (column, value) in data {
            placeholders.push(format!(":{}", self.bind(column, value.clone())));
            columns.push(column.clone());
        }
        self.statement = Statement::Insert {
            columns,
            placeholders,
        };
        self.step = Step::Insert;
        Ok(self)
    }

    /// `UPDATE table SET ...`
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::insert`].
    pub fn update(&mut self, data: &QueryParams) -> Result<&mut Self> {
        self.guard("update", STATEMENT_START)?;
        if data.is_empty() {
            return Err(Error::query_argument("update needs at least one column"));
        }
        for column in data.keys() {
            validate_identifier(column)?;
        }

        let mut assignments = Vec::with_capacity(data.len());
        for (column, value) in data {
            let name = self.bind(column, value.clone());
            assignments.push(format!("{column} = :{name}"));
        }
        self.statement = Statement::Update { assignments };
        self.step = Step::Update;
        Ok(self)
    }

    /// `DELETE FROM table`
    ///
    /// # Errors
    ///
    /// `QueryOrder` unless the builder is fresh.
    pub fn delete(&mut self) -> Result<&mut Self> {
        self.guard("delete", STATEMENT_START)?;
        self.statement = Statement::Delete;
        self.step = Step::Delete;
        Ok(self)
    }

    /// Empty the table (`DELETE FROM` on SQLite)
    ///
    /// # Errors
    ///
    /// `QueryOrder` unless the builder is fresh.
    pub fn truncate(&mut self) -> Result<&mut Self> {
        self.guard("truncate", STATEMENT_START)?;
        self.statement = Statement::Truncate;
        self.step = Step::Truncate;
        Ok(self)
    }

    /// Hand-written statement with its own `:name` parameters
    ///
    /// # Errors
    ///
    /// `QueryOrder` unless the builder is fresh; `QueryArgument` for empty
    /// SQL.
    pub fn raw_query(&mut self, sql: &str, params: &QueryParams) -> Result<&mut Self> {
        self.guard("raw_query", STATEMENT_START)?;
        if sql.trim().is_empty() {
            return Err(Error::query_argument("raw query is empty"));
        }
        self.statement = Statement::Raw(sql.to_string());
        self.binds.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.step = Step::Raw;
        Ok(self)
    }

    /// `col = :col`, or `col LIKE :col` when the value contains `%`
    ///
    /// A null value renders `col IS NULL`.
    ///
    /// # Errors
    ///
    /// `QueryOrder` when no filterable statement was started;
    /// `QueryArgument` for a bad column.
    pub fn where_eq(&mut self, column: &str, value: impl Into<Value>) -> Result<&mut Self> {
        self.guard("where", FILTERABLE)?;
        validate_column(column)?;
        let value = value.into();
        let condition = match &value {
            Value::Null => format!("{column} IS NULL"),
            Value::String(s) if s.contains('%') => {
                format!("{column} LIKE :{}", self.bind(column, value.clone()))
            }
            _ => format!("{column} = :{}", self.bind(column, value.clone())),
        };
        self.push_condition("AND", condition);
        self.step = Step::Where;
        Ok(self)
    }

    /// `col <op> :col` with a whitelisted operator
    ///
    /// # Errors
    ///
    /// As [`QueryBuilder::where_eq`], plus `QueryArgument` for an unknown
    /// operator.
    pub fn where_op(&mut self, column: &str, operator: &str, value: impl Into<Value>) -> Result<&mut Self> {
        self.guard("where", FILTERABLE)?;
        validate_column(column)?;
        let operator = validate_operator(operator)?;
        let name = self.bind(column, value.into());
        self.push_condition("AND", format!("{column} {operator} :{name}"));
        self.step = Step::Where;
        Ok(self)
    }

    /// `OR col = :col`
    ///
    /// # Errors
    ///
    /// `QueryOrder` unless a condition precedes it.
    pub fn or_where(&mut self, column: &str, operator: &str, value: impl Into<Value>) -> Result<&mut Self> {
        self.guard("or_where", CHAINED_FILTER)?;
        validate_column(column)?;
        let operator = validate_operator(operator)?;
        let name = self.bind(column, value.into());
        self.push_condition("OR", format!("{column} {operator} :{name}"));
        self.step = Step::Where;
        Ok(self)
    }

    /// `col IN (:col_0, :col_1, ...)`
    ///
    /// # Errors
    ///
    /// As [`QueryBuilder::where_eq`], plus `QueryArgument` for an empty list.
    pub fn where_in(&mut self, column: &str, values: Vec<Value>) -> Result<&mut Self> {
        self.guard("where_in", FILTERABLE)?;
        validate_column(column)?;
        if values.is_empty() {
            return Err(Error::query_argument("where_in needs at least one value"));
        }
        let placeholders: Vec<String> = values
            .into_iter()
            .map(|value| format!(":{}", self.bind(column, value)))
            .collect();
        self.push_condition("AND", format!("{column} IN ({})", placeholders.join(", ")));
        self.step = Step::Where;
        Ok(self)
    }

    /// `col BETWEEN :low AND :high`
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::where_eq`].
    pub fn between(&mut self, column: &str, low: impl Into<Value>, high: impl Into<Value>) -> Result<&mut Self> {
        self.guard("between", FILTERABLE)?;
        validate_column(column)?;
        let low = self.bind(column, low.into());
        let high = self.bind(column, high.into());
        self.push_condition("AND", format!("{column} BETWEEN :{low} AND :{high}"));
        self.step = Step::Between;
        Ok(self)
    }

    /// `col IN (<inner statement>)`
    ///
    /// The inner builder's parameters are merged, renamed where they clash.
    ///
    /// # Errors
    ///
    /// As [`QueryBuilder::where_eq`], plus whatever rendering `inner` fails
    /// with.
    pub fn subquery(&mut self, column: &str, inner: &Self) -> Result<&mut Self> {
        self.guard("subquery", FILTERABLE)?;
        validate_column(column)?;
        let sql = self.absorb(inner)?;
        self.push_condition("AND", format!("{column} IN ({sql})"));
        self.step = Step::Where;
        Ok(self)
    }

    /// `INNER JOIN table ON first op second`
    ///
    /// # Errors
    ///
    /// `QueryOrder` unless a select-type statement was started and no
    /// condition added yet; `QueryArgument` for bad identifiers.
    pub fn join(&mut self, table: &str, first: &str, operator: &str, second: &str) -> Result<&mut Self> {
        self.add_join("join", "INNER JOIN", table, first, operator, second)
    }

    /// `LEFT JOIN`
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::join`].
    pub fn left_join(&mut self, table: &str, first: &str, operator: &str, second: &str) -> Result<&mut Self> {
        self.add_join("left_join", "LEFT JOIN", table, first, operator, second)
    }

    /// `RIGHT JOIN`
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::join`].
    pub fn right_join(&mut self, table: &str, first: &str, operator: &str, second: &str) -> Result<&mut Self> {
        self.add_join("right_join", "RIGHT JOIN", table, first, operator, second)
    }

    /// `FULL OUTER JOIN`
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::join`].
    pub fn outer_join(&mut self, table: &str, first: &str, operator: &str, second: &str) -> Result<&mut Self> {
        self.add_join("outer_join", "FULL OUTER JOIN", table, first, operator, second)
    }

    fn add_join(
        &mut self,
        method: &'static str,
        keyword: &str,
        table: &str,
        first: &str,
        operator: &str,
        second: &str,
    ) -> Result<&mut Self> {
        self.guard(method, JOINABLE)?;
        validate_table(table)?;
        validate_column(first)?;
        validate_column(second)?;
        let operator = validate_operator(operator)?;
        self.joins
            .push(format!("{keyword} {table} ON {first} {operator} {second}"));
        self.step = Step::Join;
        Ok(self)
    }

    /// Alias for the main table (`FROM users AS u`)
    ///
    /// # Errors
    ///
    /// `QueryOrder` unless called right after the select-type method;
    /// `QueryArgument` for a bad alias.
    pub fn alias(&mut self, alias: &str) -> Result<&mut Self> {
        self.guard("alias", ALIASABLE)?;
        validate_identifier(alias)?;
        self.alias = Some(alias.to_string());
        Ok(self)
    }

    /// `GROUP BY cols`
    ///
    /// # Errors
    ///
    /// `QueryOrder` / `QueryArgument` as usual.
    pub fn group_by(&mut self, columns: &[&str]) -> Result<&mut Self> {
        self.guard("group_by", GROUPABLE)?;
        if columns.is_empty() {
            return Err(Error::query_argument("group_by needs at least one column"));
        }
        for column in columns {
            validate_column(column)?;
        }
        self.groups.extend(columns.iter().map(|c| (*c).to_string()));
        self.step = Step::Group;
        Ok(self)
    }

    /// `HAVING expr op :value`, where `expr` may be an aggregate like
    /// `COUNT(id)`
    ///
    /// # Errors
    ///
    /// `QueryOrder` unless it follows `group_by`.
    pub fn having(&mut self, column: &str, operator: &str, value: impl Into<Value>) -> Result<&mut Self> {
        self.guard("having", HAVING)?;
        validate_column_expression(column)?;
        let operator = validate_operator(operator)?;
        let name = self.bind(column, value.into());
        self.having.push(format!("{column} {operator} :{name}"));
        Ok(self)
    }

    /// `ORDER BY col ASC|DESC`; repeated calls append
    ///
    /// # Errors
    ///
    /// `QueryOrder` / `QueryArgument` as usual.
    pub fn order_by(&mut self, column: &str, direction: &str) -> Result<&mut Self> {
        self.guard("order_by", ORDERABLE)?;
        validate_column(column)?;
        let direction = direction.trim().to_ascii_uppercase();
        if direction != "ASC" && direction != "DESC" {
            return Err(Error::query_argument(format!(
                "order direction must be ASC or DESC, got '{direction}'"
            )));
        }
        self.orders.push(format!("{column} {direction}"));
        self.step = Step::Order;
        Ok(self)
    }

    /// `LIMIT n` with `n > 0`
    ///
    /// # Errors
    ///
    /// `QueryOrder`, or `QueryArgument` when `n` is not positive.
    pub fn limit(&mut self, n: i64) -> Result<&mut Self> {
        self.guard("limit", LIMITABLE)?;
        let n = u64::try_from(n)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| Error::query_argument(format!("limit must be a positive integer, got {n}")))?;
        self.limit = Some(n);
        self.step = Step::Limit;
        Ok(self)
    }

    /// `OFFSET n` with `n >= 0`; only after `limit`
    ///
    /// # Errors
    ///
    /// `QueryOrder`, or `QueryArgument` when `n` is negative.
    pub fn offset(&mut self, n: i64) -> Result<&mut Self> {
        self.guard("offset", OFFSETTABLE)?;
        let n = u64::try_from(n)
            .map_err(|_| Error::query_argument(format!("offset must not be negative, got {n}")))?;
        self.offset = Some(n);
        self.step = Step::Offset;
        Ok(self)
    }

    /// `UNION [ALL] <other statement>`
    ///
    /// # Errors
    ///
    /// `QueryOrder` unless a select-type statement is being built.
    pub fn union(&mut self, other: &Self, all: bool) -> Result<&mut Self> {
        self.guard("union", UNIONABLE)?;
        let sql = self.absorb(other)?;
        let keyword = if all { "UNION ALL" } else { "UNION" };
        self.unions.push(format!("{keyword} {sql}"));
        self.step = Step::Union;
        Ok(self)
    }

    /// Render the statement built so far
    ///
    /// # Errors
    ///
    /// `QueryOrder` when no statement was started.
    pub fn to_sql(&self) -> Result<String> {
        self.render(None)
    }

    fn render(&self, backend: Option<Backend>) -> Result<String> {
        let from = self.from_clause();
        let sql = match &self.statement {
            Statement::None => {
                return Err(Error::QueryOrder {
                    method: "execute",
                    step: self.step.as_str(),
                })
            }
            Statement::Raw(sql) => sql.clone(),
            Statement::Truncate => match backend {
                Some(Backend::Sqlite) => format!("DELETE FROM {}", self.table),
                _ => format!("TRUNCATE TABLE {}", self.table),
            },
            Statement::Insert {
                columns,
                placeholders,
            } => format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.table,
                columns.join(", "),
                placeholders.join(", ")
            ),
            Statement::Update { assignments } => format!(
                "UPDATE {} SET {}{}",
                self.table,
                assignments.join(", "),
                self.where_clause()
            ),
            Statement::Delete => format!("DELETE FROM {}{}", self.table, self.where_clause()),
            Statement::Select { columns, distinct } => {
                let mut sql = format!(
                    "SELECT {}{columns} FROM {from}",
                    if *distinct { "DISTINCT " } else { "" }
                );
                self.push_select_tail(&mut sql);
                sql
            }
        };
        Ok(sql)
    }

    fn from_clause(&self) -> String {
        let mut from = self.table.clone();
        if let Some(alias) = &self.alias {
            from.push_str(" AS ");
            from.push_str(alias);
        }
        for join in &self.joins {
            from.push(' ');
            from.push_str(join);
        }
        from
    }

    fn where_clause(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.conditions.join(" "))
        }
    }

    fn push_select_tail(&self, sql: &mut String) {
        sql.push_str(&self.where_clause());
        if !self.groups.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.groups.join(", "));
        }
        if !self.having.is_empty() {
            sql.push_str(" HAVING ");
            sql.push_str(&self.having.join(" AND "));
        }
        for union in &self.unions {
            sql.push(' ');
            sql.push_str(union);
        }
        if !self.orders.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.orders.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
    }

    /// `SELECT COUNT(*)` over the current FROM / WHERE, ignoring ordering
    /// and paging
    fn render_count(&self) -> Result<String> {
        match &self.statement {
            Statement::Select { columns, distinct } => {
                let inner_needed = *distinct || !self.groups.is_empty() || !self.unions.is_empty();
                if inner_needed {
                    let mut inner = format!(
                        "SELECT {}{columns} FROM {}",
                        if *distinct { "DISTINCT " } else { "" },
                        self.from_clause()
                    );
                    inner.push_str(&self.where_clause());
                    if !self.groups.is_empty() {
                        inner.push_str(" GROUP BY ");
                        inner.push_str(&self.groups.join(", "));
                    }
                    if !self.having.is_empty() {
                        inner.push_str(" HAVING ");
                        inner.push_str(&self.having.join(" AND "));
                    }
                    for union in &self.unions {
                        inner.push(' ');
                        inner.push_str(union);
                    }
                    Ok(format!("SELECT COUNT(*) AS count FROM ({inner}) AS counted"))
                } else {
                    Ok(format!(
                        "SELECT COUNT(*) AS count FROM {}{}",
                        self.from_clause(),
                        self.where_clause()
                    ))
                }
            }
            Statement::None => Ok(format!("SELECT COUNT(*) AS count FROM {}", self.table)),
            _ => Err(Error::QueryOrder {
                method: "count_value",
                step: self.step.as_str(),
            }),
        }
    }

    fn push_condition(&mut self, connector: &str, condition: String) {
        if self.conditions.is_empty() {
            self.conditions.push(condition);
        } else {
            self.conditions.push(format!("{connector} {condition}"));
        }
    }

    /// Record `value` under a placeholder derived from `column`, returning
    /// the placeholder name without its colon
    fn bind(&mut self, column: &str, value: Value) -> String {
        let base: String = column
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        let base = base.trim_matches('_').to_ascii_lowercase();
        // placeholders must start with a letter to be recognized as names
        let base = match base.chars().next() {
            None => "p".to_string(),
            Some(c) if c.is_ascii_digit() => format!("p_{base}"),
            Some(_) => base,
        };
        let name = self.unique_name(&base);
        self.binds.insert(name.clone(), value);
        name
    }

    fn unique_name(&self, base: &str) -> String {
        if !self.binds.contains_key(base) {
            return base.to_string();
        }
        (2..)
            .map(|n| format!("{base}_{n}"))
            .find(|candidate| !self.binds.contains_key(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    /// Render `inner` and merge its parameters, renaming any that clash
    fn absorb(&mut self, inner: &Self) -> Result<String> {
        let mut sql = inner.to_sql()?;
        let mut names: Vec<&String> = inner.binds.keys().collect();
        // longest first so `:id` never rewrites part of `:id_2`
        names.sort_by_key(|n| std::cmp::Reverse(n.len()));

        let mut renamed = Vec::with_capacity(names.len());
        for name in names {
            let value = inner.binds[name].clone();
            if self.binds.contains_key(name) {
                let fresh = self.unique_name(name);
                let pattern = Regex::new(&format!(r":{}\b", regex::escape(name))).map_err(|e| {
                    Error::query_argument(format!("cannot rename parameter {name}: {e}"))
                })?;
                sql = pattern.replace_all(&sql, format!(":{fresh}").as_str()).into_owned();
                self.binds.insert(fresh.clone(), value);
                renamed.push(fresh);
            } else {
                self.binds.insert(name.clone(), value);
            }
        }
        if !renamed.is_empty() {
            debug!(renamed = ?renamed, "Renamed clashing subquery parameters");
        }
        Ok(sql)
    }

    /// Forget the statement, keeping the table
    pub fn reset(&mut self) {
        self.alias = None;
        self.step = Step::Initial;
        self.statement = Statement::None;
        self.joins.clear();
        self.conditions.clear();
        self.groups.clear();
        self.having.clear();
        self.unions.clear();
        self.orders.clear();
        self.limit = None;
        self.offset = None;
        self.binds.clear();
    }

    /// Run the statement
    ///
    /// The builder is reset afterwards, whether or not the statement
    /// succeeded.
    ///
    /// # Errors
    ///
    /// `QueryOrder` when nothing was built; `QueryExecution` carrying the
    /// driver message when the statement fails.
    pub async fn execute(&mut self, db: &Database) -> Result<QueryResult> {
        let rendered = self.render(Some(db.backend()));
        let params = std::mem::take(&mut self.binds);
        self.reset();
        let sql = rendered?;
        run(db, &sql, &params).await
    }

    /// Run the statement and return its rows
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::execute`].
    pub async fn get(&mut self, db: &Database) -> Result<Vec<Row>> {
        Ok(self.execute(db).await?.rows)
    }

    /// First row, limiting the statement to one row when no limit was set
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::execute`].
    pub async fn first(&mut self, db: &Database) -> Result<Option<Row>> {
        if self.limit.is_none() && LIMITABLE.contains(&self.step) {
            self.limit(1)?;
        }
        Ok(self.get(db).await?.into_iter().next())
    }

    /// Number of rows the current select (or the whole table) matches
    ///
    /// # Errors
    ///
    /// `QueryOrder` for a non-select statement; otherwise see
    /// [`QueryBuilder::execute`].
    pub async fn count_value(&mut self, db: &Database) -> Result<i64> {
        let rendered = self.render_count();
        let params = std::mem::take(&mut self.binds);
        self.reset();
        let result = run(db, &rendered?, &params).await?;
        Ok(first_integer(&result.rows))
    }

    /// Run the current select for page `page` (1-based) of `per_page` rows
    ///
    /// # Errors
    ///
    /// `QueryArgument` for a zero page size or page; `QueryOrder` when the
    /// statement cannot be paged; otherwise see [`QueryBuilder::execute`].
    pub async fn paginate(&mut self, db: &Database, per_page: u64, page: u64) -> Result<Page> {
        if per_page == 0 || page == 0 {
            self.reset();
            return Err(Error::query_argument("per_page and page must be at least 1"));
        }
        if self.step == Step::Initial {
            self.select(&[])?;
        }
        if let Err(err) = self.guard("paginate", LIMITABLE) {
            self.reset();
            return Err(err);
        }

        let count_sql = match self.render_count() {
            Ok(sql) => sql,
            Err(err) => {
                self.reset();
                return Err(err);
            }
        };
        let total = match run(db, &count_sql, &self.binds).await {
            Ok(result) => first_integer(&result.rows),
            Err(err) => {
                self.reset();
                return Err(err);
            }
        };

        let offset = (page - 1).saturating_mul(per_page);
        self.limit = Some(per_page);
        self.offset = Some(offset);
        self.step = Step::Offset;
        let data = self.get(db).await?;

        let total_rows = u64::try_from(total).unwrap_or(0);
        Ok(Page {
            data,
            total,
            per_page,
            current_page: page,
            total_pages: total_rows.saturating_add(per_page - 1) / per_page,
        })
    }
}

async fn run(db: &Database, sql: &str, params: &QueryParams) -> Result<QueryResult> {
    db.query(sql, params).await.map_err(|err| match err {
        Error::Database { message } => Error::QueryExecution { message },
        other => other,
    })
}

fn first_integer(rows: &[Row]) -> i64 {
    rows.first()
        .and_then(|row| row.values().next())
        .and_then(|value| match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .unwrap_or(0)
}

/// Plain identifier: letters, digits and underscores, not starting with a digit
///
/// # Errors
///
/// `QueryArgument` otherwise.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::query_argument(format!("invalid identifier '{name}'")))
    }
}

/// `column` or `table.column`, optionally `table.*`
fn validate_column(column: &str) -> Result<()> {
    let mut parts = column.split('.');
    let (first, second, rest) = (parts.next(), parts.next(), parts.next());
    match (first, second, rest) {
        (Some(name), None, None) => validate_identifier(name),
        (Some(table), Some("*"), None) => validate_identifier(table),
        (Some(table), Some(name), None) => {
            validate_identifier(table)?;
            validate_identifier(name)
        }
        _ => Err(Error::query_argument(format!("invalid column '{column}'"))),
    }
}

/// Column, or `FUNC(column)` / `FUNC(*)`
fn validate_column_expression(expression: &str) -> Result<()> {
    if let Some((function, rest)) = expression.split_once('(') {
        let Some(argument) = rest.strip_suffix(')') else {
            return Err(Error::query_argument(format!(
                "invalid expression '{expression}'"
            )));
        };
        validate_identifier(function)?;
        if argument == "*" {
            return Ok(());
        }
        return validate_column(argument);
    }
    validate_column(expression)
}

/// Table name, optionally with an alias (`posts p`, `posts AS p`)
fn validate_table(table: &str) -> Result<()> {
    let parts: Vec<&str> = table.split_whitespace().collect();
    match parts.as_slice() {
        [name] => validate_identifier(name),
        [name, alias] => {
            validate_identifier(name)?;
            validate_identifier(alias)
        }
        [name, keyword, alias] if keyword.eq_ignore_ascii_case("AS") => {
            validate_identifier(name)?;
            validate_identifier(alias)
        }
        _ => Err(Error::query_argument(format!("invalid table '{table}'"))),
    }
}

fn validate_operator(operator: &str) -> Result<&'static str> {
    let normalized = operator.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_uppercase();
    OPERATORS
        .iter()
        .find(|op| **op == normalized)
        .copied()
        .ok_or_else(|| Error::query_argument(format!("unsupported operator '{operator}'")))
}

/// Comma-separated column list; each entry may carry `AS alias`
fn column_list(columns: &[&str]) -> Result<String> {
    if columns.is_empty() {
        return Ok("*".to_string());
    }
    for column in columns {
        let parts: Vec<&str> = column.split_whitespace().collect();
        match parts.as_slice() {
            ["*"] => {}
            [expr] => validate_column_expression(expr)?,
            [expr, keyword, alias] if keyword.eq_ignore_ascii_case("AS") => {
                validate_column_expression(expr)?;
                validate_identifier(alias)?;
            }
            _ => {
                return Err(Error::query_argument(format!("invalid column '{column}'")));
            }
        }
    }
    Ok(columns.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::params;
    use serde_json::json;

    fn users() -> QueryBuilder {
        QueryBuilder::new("users").unwrap()
    }

    #[test]
    fn test_where_then_insert_is_order_error() {
        let mut qb = users();
        qb.select(&[]).unwrap().where_eq("id", 1).unwrap();
        let err = qb.insert(&params(json!({ "name": "x" }))).unwrap_err();
        assert!(matches!(
            err,
            Error::QueryOrder { method: "insert", step: "where" }
        ));
        // nothing was mutated
        assert_eq!(qb.step(), Step::Where);
        assert_eq!(qb.params().len(), 1);
    }

    #[test]
    fn test_where_needs_a_statement() {
        let mut qb = users();
        assert!(matches!(
            qb.where_eq("id", 1),
            Err(Error::QueryOrder { method: "where", step: "initial" })
        ));
    }

    #[test]
    fn test_select_where_order_succeeds() {
        let mut qb = users();
        qb.select(&["id", "name"])
            .unwrap()
            .where_eq("active", true)
            .unwrap()
            .order_by("name", "asc")
            .unwrap();
        assert_eq!(
            qb.to_sql().unwrap(),
            "SELECT id, name FROM users WHERE active = :active ORDER BY name ASC"
        );
        assert_eq!(qb.params()["active"], json!(true));
    }

    #[test]
    fn test_limit_and_offset_arguments() {
        let mut qb = users();
        qb.select(&[]).unwrap();
        assert!(matches!(qb.limit(0), Err(Error::QueryArgument { .. })));
        assert_eq!(qb.step(), Step::Select);

        qb.limit(5).unwrap();
        assert!(matches!(qb.offset(-1), Err(Error::QueryArgument { .. })));
        qb.offset(0).unwrap();
        assert_eq!(qb.to_sql().unwrap(), "SELECT * FROM users LIMIT 5 OFFSET 0");
    }

    #[test]
    fn test_offset_requires_limit() {
        let mut qb = users();
        qb.select(&[]).unwrap();
        assert!(matches!(
            qb.offset(10),
            Err(Error::QueryOrder { method: "offset", step: "select" })
        ));
    }

    #[test]
    fn test_wildcard_uses_like() {
        let mut qb = users();
        qb.select(&[]).unwrap().where_eq("name", "An%").unwrap();
        assert_eq!(qb.to_sql().unwrap(), "SELECT * FROM users WHERE name LIKE :name");
    }

    #[test]
    fn test_null_and_repeated_columns() {
        let mut qb = users();
        qb.select(&[])
            .unwrap()
            .where_eq("deleted_at", Value::Null)
            .unwrap()
            .where_op("age", ">=", 18)
            .unwrap()
            .where_op("age", "<", 65)
            .unwrap()
            .or_where("role", "=", "admin")
            .unwrap();
        assert_eq!(
            qb.to_sql().unwrap(),
            "SELECT * FROM users WHERE deleted_at IS NULL AND age >= :age AND age < :age_2 OR role = :role"
        );
        assert_eq!(qb.params()["age_2"], json!(65));
    }

    #[test]
    fn test_digit_leading_column_gets_named_placeholder() {
        let mut qb = users();
        qb.select(&[]).unwrap().where_eq("_1", 5).unwrap().where_eq("_1", 6).unwrap();
        assert_eq!(
            qb.to_sql().unwrap(),
            "SELECT * FROM users WHERE _1 = :p_1 AND _1 = :p_1_2"
        );
        assert_eq!(qb.params()["p_1"], json!(5));
    }

    #[test]
    fn test_joins_spliced_after_from() {
        let mut qb = users();
        qb.select(&["u.name", "p.title AS post"])
            .unwrap()
            .alias("u")
            .unwrap()
            .left_join("posts p", "p.user_id", "=", "u.id")
            .unwrap()
            .where_eq("u.id", 3)
            .unwrap();
        assert_eq!(
            qb.to_sql().unwrap(),
            "SELECT u.name, p.title AS post FROM users AS u LEFT JOIN posts p ON p.user_id = u.id WHERE u.id = :u_id"
        );
    }

    #[test]
    fn test_join_after_where_rejected() {
        let mut qb = users();
        qb.select(&[]).unwrap().where_eq("id", 1).unwrap();
        assert!(matches!(
            qb.join("posts", "posts.user_id", "=", "users.id"),
            Err(Error::QueryOrder { method: "join", .. })
        ));
    }

    #[test]
    fn test_group_having() {
        let mut qb = QueryBuilder::new("orders").unwrap();
        qb.select(&["user_id", "COUNT(id) AS orders"])
            .unwrap()
            .group_by(&["user_id"])
            .unwrap()
            .having("COUNT(id)", ">", 2)
            .unwrap()
            .order_by("user_id", "DESC")
            .unwrap();
        assert_eq!(
            qb.to_sql().unwrap(),
            "SELECT user_id, COUNT(id) AS orders FROM orders GROUP BY user_id HAVING COUNT(id) > :count_id ORDER BY user_id DESC"
        );
    }

    #[test]
    fn test_subquery_renames_clashing_params() {
        let mut inner = QueryBuilder::new("bans").unwrap();
        inner.select(&["user_id"]).unwrap().where_eq("active", true).unwrap();

        let mut qb = users();
        qb.select(&[])
            .unwrap()
            .where_eq("active", false)
            .unwrap()
            .subquery("id", &inner)
            .unwrap();
        assert_eq!(
            qb.to_sql().unwrap(),
            "SELECT * FROM users WHERE active = :active AND id IN (SELECT user_id FROM bans WHERE active = :active_2)"
        );
        assert_eq!(qb.params()["active"], json!(false));
        assert_eq!(qb.params()["active_2"], json!(true));
    }

    #[test]
    fn test_update_and_delete() {
        let mut qb = users();
        qb.update(&params(json!({ "name": "Ana" })))
            .unwrap()
            .where_eq("name", "Bea")
            .unwrap();
        assert_eq!(
            qb.to_sql().unwrap(),
            "UPDATE users SET name = :name WHERE name = :name_2"
        );

        let mut qb = users();
        qb.delete().unwrap().where_in("id", vec![json!(1), json!(2)]).unwrap();
        assert_eq!(
            qb.to_sql().unwrap(),
            "DELETE FROM users WHERE id IN (:id, :id_2)"
        );
    }

    #[test]
    fn test_rejects_bad_identifiers_and_operators() {
        assert!(QueryBuilder::new("users; DROP TABLE x").is_err());
        let mut qb = users();
        assert!(matches!(qb.select(&["id); --"]), Err(Error::QueryArgument { .. })));
        qb.select(&[]).unwrap();
        assert!(matches!(qb.where_op("id", "; DROP", 1), Err(Error::QueryArgument { .. })));
        assert!(matches!(qb.order_by("id", "sideways"), Err(Error::QueryArgument { .. })));
        assert!(matches!(qb.where_in("id", vec![]), Err(Error::QueryArgument { .. })));
    }

    #[test]
    fn test_union_and_aggregates() {
        let mut admins = QueryBuilder::new("admins").unwrap();
        admins.select(&["email"]).unwrap();
        let mut qb = users();
        qb.select(&["email"]).unwrap().union(&admins, true).unwrap().limit(3).unwrap();
        assert_eq!(
            qb.to_sql().unwrap(),
            "SELECT email FROM users UNION ALL SELECT email FROM admins LIMIT 3"
        );

        let mut qb = QueryBuilder::new("orders").unwrap();
        qb.aggregate(Aggregate::Sum, "amount").unwrap();
        assert_eq!(qb.to_sql().unwrap(), "SELECT SUM(amount) AS total FROM orders");
    }

    #[test]
    fn test_between_and_distinct() {
        let mut qb = users();
        qb.distinct(&["city"]).unwrap().between("age", 18, 30).unwrap();
        assert_eq!(
            qb.to_sql().unwrap(),
            "SELECT DISTINCT city FROM users WHERE age BETWEEN :age AND :age_2"
        );
    }

    #[test]
    fn test_to_sql_without_statement() {
        assert!(matches!(users().to_sql(), Err(Error::QueryOrder { .. })));
    }

    async fn seeded() -> Database {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.execute_raw(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)",
            &QueryParams::new(),
        )
        .await
        .unwrap();
        for (name, age) in [("Ana", 31), ("Bea", 22), ("Caio", 45), ("Dani", 19), ("Edu", 27)] {
            let mut qb = db.table("users").unwrap();
            qb.insert(&params(json!({ "name": name, "age": age })))
                .unwrap()
                .execute(&db)
                .await
                .unwrap();
        }
        db
    }

    #[tokio::test]
    async fn test_execute_resets_for_reuse() {
        let db = seeded().await;
        let mut qb = db.table("users").unwrap();

        let rows = qb
            .select(&["name"])
            .unwrap()
            .where_op("age", ">", 25)
            .unwrap()
            .order_by("name", "ASC")
            .unwrap()
            .get(&db)
            .await
            .unwrap();
        let names: Vec<&str> = rows.iter().filter_map(|r| r["name"].as_str()).collect();
        assert_eq!(names, vec!["Ana", "Caio", "Edu"]);

        assert_eq!(qb.step(), Step::Initial);
        assert!(qb.params().is_empty());

        let first = qb
            .select(&[])
            .unwrap()
            .where_eq("name", "B%")
            .unwrap()
            .first(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first["age"], json!(22));
    }

    #[tokio::test]
    async fn test_driver_failure_is_wrapped() {
        let db = seeded().await;
        let mut qb = db.table("users").unwrap();
        qb.select(&["missing_column"]).unwrap();
        let err = qb.get(&db).await.unwrap_err();
        match err {
            Error::QueryExecution { message } => assert!(message.contains("missing_column")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(qb.step(), Step::Initial);
        assert!(db.has_error());
    }

    #[tokio::test]
    async fn test_count_update_delete_truncate() {
        let db = seeded().await;
        let mut qb = db.table("users").unwrap();
        assert_eq!(qb.count_value(&db).await.unwrap(), 5);

        qb.select(&[]).unwrap().where_op("age", "<", 25).unwrap();
        assert_eq!(qb.count_value(&db).await.unwrap(), 2);

        let updated = qb
            .update(&params(json!({ "age": 50 })))
            .unwrap()
            .where_eq("name", "Ana")
            .unwrap()
            .execute(&db)
            .await
            .unwrap();
        assert_eq!(updated.rows_affected, 1);

        let deleted = qb
            .delete()
            .unwrap()
            .where_op("age", ">=", 45)
            .unwrap()
            .execute(&db)
            .await
            .unwrap();
        assert_eq!(deleted.rows_affected, 2);

        qb.truncate().unwrap().execute(&db).await.unwrap();
        assert_eq!(qb.count_value(&db).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_paginate() {
        let db = seeded().await;
        let mut qb = db.table("users").unwrap();
        qb.select(&["name"]).unwrap().order_by("id", "ASC").unwrap();
        let page = qb.paginate(&db, 2, 3).await.unwrap();

        assert_eq!(page.total, 5);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0]["name"], json!("Edu"));
        assert!(matches!(
            qb.paginate(&db, 0, 1).await,
            Err(Error::QueryArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_null_comparison_matches_null_rows() {
        let db = seeded().await;
        db.execute_raw("INSERT INTO users (name, age) VALUES ('Fabi', NULL)", &QueryParams::new())
            .await
            .unwrap();
        let mut qb = db.table("users").unwrap();

        let rows = qb
            .select(&["name"])
            .unwrap()
            .where_op("age", "=", Value::Null)
            .unwrap()
            .get(&db)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("Fabi"));

        qb.select(&[]).unwrap().where_op("age", "!=", Value::Null).unwrap();
        assert_eq!(qb.count_value(&db).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_builder_runs_inside_transaction() {
        let db = seeded().await;
        let tx = db.begin_transaction().await.unwrap();
        let mut qb = tx.table("users").unwrap();
        qb.delete().unwrap().where_op("age", "<", 30).unwrap().execute(&tx).await.unwrap();
        assert_eq!(qb.count_value(&tx).await.unwrap(), 2);
        tx.rollback().await.unwrap();

        assert_eq!(qb.count_value(&db).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_raw_query() {
        let db = seeded().await;
        let mut qb = db.table("users").unwrap();
        let rows = qb
            .raw_query(
                "SELECT name FROM users WHERE age > :age ORDER BY age DESC",
                &params(json!({ "age": 30 })),
            )
            .unwrap()
            .get(&db)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], json!("Caio"));
    }
}
