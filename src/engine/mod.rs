use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use rmpv::Value;
use serde::Deserialize;

use crate::wire::envelope::ParameterMap;

pub const START_PARAMETER: &str = "start";
pub const SIZE_PARAMETER: &str = "size";

/// Executes query text against whatever backs the server.
pub trait QueryEngine: Send + Sync {
    fn execute(&self, query: &str, parameters: &ParameterMap) -> Result<TabularResult, QueryError>;
}

#[derive(Debug)]
pub enum QueryError {
    UnknownTable { name: String },
    InvalidParameter { name: String, reason: &'static str },
    FixtureRead { path: String, source: io::Error },
    FixtureParse { path: String, source: toml::de::Error },
    InvalidFixture { table: String, reason: String },
    Execution(String),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownTable { name } => write!(f, "unknown table '{name}'"),
            Self::InvalidParameter { name, reason } => {
                write!(f, "invalid parameter '{name}': {reason}")
            }
            Self::FixtureRead { path, source } => {
                write!(f, "failed to read fixtures file '{path}': {source}")
            }
            Self::FixtureParse { path, source } => {
                write!(f, "failed to parse fixtures file '{path}': {source}")
            }
            Self::InvalidFixture { table, reason } => {
                write!(f, "invalid fixture table '{table}': {reason}")
            }
            Self::Execution(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for QueryError {}

/// Raw engine output: ordered columns and every produced row.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TabularResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl TabularResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn single(column: impl Into<String>, value: Value) -> Self {
        Self::new(vec![column.into()], vec![vec![value]])
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pagination {
    pub start: usize,
    /// 0 means unbounded.
    pub size: usize,
}

impl Pagination {
    pub fn from_parameters(parameters: &ParameterMap) -> Result<Self, QueryError> {
        Ok(Self {
            start: read_count(parameters, START_PARAMETER)?,
            size: read_count(parameters, SIZE_PARAMETER)?,
        })
    }
}

fn read_count(parameters: &ParameterMap, name: &str) -> Result<usize, QueryError> {
    let Some(value) = parameters.get(name) else {
        return Ok(0);
    };

    match value {
        Value::Nil => Ok(0),
        Value::Integer(integer) => integer
            .as_u64()
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| QueryError::InvalidParameter {
                name: name.to_owned(),
                reason: "must be a non-negative integer",
            }),
        _ => Err(QueryError::InvalidParameter {
            name: name.to_owned(),
            reason: "must be an integer",
        }),
    }
}

/// One page of a tabular result as sent in a `RESULT` envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultSet {
    pub first: usize,
    pub max: Option<usize>,
    pub total: usize,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    /// `total` counts every produced row, including the ones cut off.
    pub fn paginate(result: TabularResult, page: Pagination) -> Self {
        let total = result.rows.len();
        let limit = if page.size > 0 { page.size } else { usize::MAX };
        let rows = result
            .rows
            .into_iter()
            .skip(page.start)
            .take(limit)
            .collect();

        Self {
            first: page.start,
            max: (page.size > 0).then_some(page.size),
            total,
            columns: result.columns,
            rows,
        }
    }

    pub fn unpaged(result: TabularResult) -> Self {
        Self::paginate(result, Pagination::default())
    }

    pub fn to_value(&self) -> Value {
        let mut entries = vec![
            (Value::from("first"), Value::from(self.first as u64)),
            (Value::from("total"), Value::from(self.total as u64)),
            (
                Value::from("columns"),
                Value::Array(self.columns.iter().map(|c| Value::from(c.as_str())).collect()),
            ),
            (
                Value::from("rows"),
                Value::Array(self.rows.iter().cloned().map(Value::Array).collect()),
            ),
        ];
        if let Some(max) = self.max {
            entries.insert(1, (Value::from("max"), Value::from(max as u64)));
        }

        Value::Map(entries)
    }
}

#[derive(Debug, Deserialize)]
struct FixtureTable {
    columns: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<toml::Value>>,
}

/// Engine over named in-memory tables. The query text names the table;
/// parameters whose key matches a column filter rows by equality.
#[derive(Debug, Default)]
pub struct FixtureQueryEngine {
    tables: HashMap<String, TabularResult>,
}

impl FixtureQueryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self, QueryError> {
        let display_path = path.display().to_string();
        let content = fs::read_to_string(path).map_err(|source| QueryError::FixtureRead {
            path: display_path.clone(),
            source,
        })?;
        Self::from_toml_str(&content, &display_path)
    }

    pub fn from_toml_str(content: &str, display_path: &str) -> Result<Self, QueryError> {
        let raw: HashMap<String, FixtureTable> =
            toml::from_str(content).map_err(|source| QueryError::FixtureParse {
                path: display_path.to_owned(),
                source,
            })?;

        let mut engine = Self::new();
        for (name, table) in raw {
            let rows = table
                .rows
                .into_iter()
                .enumerate()
                .map(|(index, row)| {
                    if row.len() != table.columns.len() {
                        return Err(QueryError::InvalidFixture {
                            table: name.clone(),
                            reason: format!(
                                "row {index} has {} values for {} columns",
                                row.len(),
                                table.columns.len()
                            ),
                        });
                    }
                    Ok(row.into_iter().map(toml_to_value).collect())
                })
                .collect::<Result<Vec<_>, _>>()?;
            engine.insert_table(name, TabularResult::new(table.columns, rows));
        }

        Ok(engine)
    }

    pub fn insert_table(&mut self, name: impl Into<String>, table: TabularResult) {
        self.tables.insert(name.into(), table);
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}

impl QueryEngine for FixtureQueryEngine {
    fn execute(&self, query: &str, parameters: &ParameterMap) -> Result<TabularResult, QueryError> {
        let name = query.trim();
        let table = self.tables.get(name).ok_or_else(|| QueryError::UnknownTable {
            name: name.to_owned(),
        })?;

        let filters = table
            .columns
            .iter()
            .enumerate()
            .filter_map(|(index, column)| parameters.get(column).map(|value| (index, value)))
            .collect::<Vec<_>>();

        let rows = table
            .rows
            .iter()
            .filter(|row| filters.iter().all(|(index, value)| row.get(*index) == Some(*value)))
            .cloned()
            .collect();

        Ok(TabularResult::new(table.columns.clone(), rows))
    }
}

fn toml_to_value(value: toml::Value) -> Value {
    match value {
        toml::Value::String(v) => Value::from(v),
        toml::Value::Integer(v) => Value::from(v),
        toml::Value::Float(v) => Value::F64(v),
        toml::Value::Boolean(v) => Value::Boolean(v),
        toml::Value::Datetime(v) => Value::from(v.to_string()),
        toml::Value::Array(values) => Value::Array(values.into_iter().map(toml_to_value).collect()),
        toml::Value::Table(table) => Value::Map(
            table
                .into_iter()
                .map(|(key, value)| (Value::from(key), toml_to_value(value)))
                .collect(),
        ),
    }
}
