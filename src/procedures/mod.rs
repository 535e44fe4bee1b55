use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use rmpv::Value;
use serde_json::json;

use crate::engine::{Pagination, QueryEngine, QueryError, ResultSet, TabularResult};
use crate::logging::{LogLevel, Logger};
use crate::wire::envelope::ParameterMap;

pub const REQUEST_ID_PROCEDURE: &str = "request_id";
const COMMENT_PREFIX: char = '#';

#[derive(Debug)]
pub enum ProcedureError {
    Query(QueryError),
    MissingParameter { name: &'static str },
    Failed(String),
    DefinitionRead { path: String, source: io::Error },
}

impl fmt::Display for ProcedureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query(source) => write!(f, "failed to execute query:\n{source}"),
            Self::MissingParameter { name } => write!(f, "missing parameter '{name}'"),
            Self::Failed(message) => f.write_str(message),
            Self::DefinitionRead { path, source } => {
                write!(f, "failed to read procedure definitions '{path}': {source}")
            }
        }
    }
}

impl std::error::Error for ProcedureError {}

impl From<QueryError> for ProcedureError {
    fn from(value: QueryError) -> Self {
        Self::Query(value)
    }
}

/// A named, server-side callable. `Ok(None)` is answered with `SUCCESS`.
pub trait Procedure: Send + Sync {
    fn name(&self) -> &str;
    fn invoke(&self, parameters: &ParameterMap) -> Result<Option<ResultSet>, ProcedureError>;
}

pub trait ProcedureRegistry: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Procedure>>;
    fn register(&self, procedure: Arc<dyn Procedure>);
    /// Returns whether something was removed.
    fn remove(&self, name: &str) -> bool;
}

#[derive(Default)]
pub struct InMemoryProcedureRegistry {
    procedures: RwLock<HashMap<String, Arc<dyn Procedure>>>,
}

impl InMemoryProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.procedures
            .read()
            .expect("procedure registry lock poisoned")
            .len()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = self
            .procedures
            .read()
            .expect("procedure registry lock poisoned")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }
}

impl ProcedureRegistry for InMemoryProcedureRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Procedure>> {
        self.procedures
            .read()
            .expect("procedure registry lock poisoned")
            .get(name)
            .cloned()
    }

    fn register(&self, procedure: Arc<dyn Procedure>) {
        self.procedures
            .write()
            .expect("procedure registry lock poisoned")
            .insert(procedure.name().to_owned(), procedure);
    }

    fn remove(&self, name: &str) -> bool {
        self.procedures
            .write()
            .expect("procedure registry lock poisoned")
            .remove(name)
            .is_some()
    }
}

/// Stored query text run through the engine, paginated by `start`/`size`.
pub struct QueryProcedure {
    name: String,
    query: String,
    engine: Arc<dyn QueryEngine>,
}

impl QueryProcedure {
    pub fn new(name: impl Into<String>, query: impl Into<String>, engine: Arc<dyn QueryEngine>) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
            engine,
        }
    }
}

impl Procedure for QueryProcedure {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, parameters: &ParameterMap) -> Result<Option<ResultSet>, ProcedureError> {
        let page = Pagination::from_parameters(parameters)?;
        let result = self.engine.execute(&self.query, parameters)?;
        Ok(Some(ResultSet::paginate(result, page)))
    }
}

type NativeFn = dyn Fn(&ParameterMap) -> Result<Option<ResultSet>, ProcedureError> + Send + Sync;

/// Procedure backed by Rust code, registered explicitly at startup.
pub struct NativeProcedure {
    name: String,
    call: Box<NativeFn>,
}

impl NativeProcedure {
    pub fn new<F>(name: impl Into<String>, call: F) -> Self
    where
        F: Fn(&ParameterMap) -> Result<Option<ResultSet>, ProcedureError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            call: Box::new(call),
        }
    }
}

impl Procedure for NativeProcedure {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, parameters: &ParameterMap) -> Result<Option<ResultSet>, ProcedureError> {
        (self.call)(parameters)
    }
}

/// `request_id(type)`: hands out `type:N` identifiers, counting from 0 per type.
pub fn request_id_procedure() -> NativeProcedure {
    let counters = Mutex::new(HashMap::<String, Arc<AtomicU64>>::new());

    NativeProcedure::new(REQUEST_ID_PROCEDURE, move |parameters| {
        let kind = parameters
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProcedureError::MissingParameter { name: "type" })?;

        let counter = counters
            .lock()
            .expect("request id counters lock poisoned")
            .entry(kind.to_owned())
            .or_default()
            .clone();
        let next = counter.fetch_add(1, Ordering::Relaxed);

        Ok(Some(ResultSet::unpaged(TabularResult::single(
            "id",
            Value::from(format!("{kind}:{next}")),
        ))))
    })
}

/// One named query parsed from a definition file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcedureDefinition {
    pub name: String,
    pub query: String,
}

/// Parses definition files: `#` lines are comments, a block's first line is
/// the procedure name, following lines are its query, a blank line ends the
/// block.
pub fn parse_definitions(content: &str) -> Vec<ProcedureDefinition> {
    let mut definitions = Vec::new();
    let mut name: Option<String> = None;
    let mut query = String::new();

    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with(COMMENT_PREFIX) {
            continue;
        }

        if line.is_empty() {
            if name.is_some() && !query.is_empty() {
                definitions.push(ProcedureDefinition {
                    name: name.take().unwrap_or_default(),
                    query: std::mem::take(&mut query),
                });
            }
        } else if name.is_some() {
            query.push_str(line);
            query.push('\n');
        } else {
            name = Some(line.to_owned());
        }
    }

    if let Some(name) = name {
        if !query.is_empty() {
            definitions.push(ProcedureDefinition { name, query });
        }
    }

    definitions
}

pub fn load_definition_file(path: &Path) -> Result<Vec<ProcedureDefinition>, ProcedureError> {
    let content = fs::read_to_string(path).map_err(|source| ProcedureError::DefinitionRead {
        path: path.display().to_string(),
        source,
    })?;
    Ok(parse_definitions(&content))
}

/// Registers every definition found in `files`. Unreadable files are logged
/// and skipped. Returns the number of registered procedures.
pub fn register_definition_files(
    files: &[String],
    registry: &dyn ProcedureRegistry,
    engine: &Arc<dyn QueryEngine>,
    logger: &Logger,
) -> usize {
    let mut registered = 0;

    for file in files.iter().map(|f| f.trim()).filter(|f| !f.is_empty()) {
        match load_definition_file(Path::new(file)) {
            Ok(definitions) => {
                for definition in definitions {
                    logger.log(
                        LogLevel::Debug,
                        Some("procedures"),
                        "Registered stored procedure",
                        Some(json!({"file": file, "name": definition.name})),
                    );
                    registry.register(Arc::new(QueryProcedure::new(
                        definition.name,
                        definition.query,
                        Arc::clone(engine),
                    )));
                    registered += 1;
                }
            }
            Err(err) => logger.log(
                LogLevel::Error,
                Some("procedures"),
                "Could not load procedure definition file",
                Some(json!({"file": file, "error": err.to_string()})),
            ),
        }
    }

    registered
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use rmpv::Value;

    use super::{
        parse_definitions, register_definition_files, request_id_procedure,
        InMemoryProcedureRegistry, NativeProcedure, Procedure, ProcedureDefinition,
        ProcedureError, ProcedureRegistry, QueryProcedure,
    };
    use crate::engine::{FixtureQueryEngine, QueryEngine, TabularResult};
    use crate::logging::tests::memory_logger;
    use crate::logging::LogLevel;
    use crate::wire::envelope::ParameterMap;

    fn numbers_engine() -> Arc<dyn QueryEngine> {
        let mut engine = FixtureQueryEngine::new();
        engine.insert_table(
            "numbers",
            TabularResult::new(
                vec!["n".to_owned()],
                (0..10).map(|n| vec![Value::from(n)]).collect(),
            ),
        );
        Arc::new(engine)
    }

    #[test]
    fn parses_blocks_comments_and_unterminated_last_block() {
        let definitions = parse_definitions(
            "# header\nall_numbers\nnumbers\n\n# second\nsome_numbers\nnum\nbers\n\n\nlast\nnumbers",
        );

        assert_eq!(
            definitions,
            vec![
                ProcedureDefinition {
                    name: "all_numbers".to_owned(),
                    query: "numbers\n".to_owned(),
                },
                ProcedureDefinition {
                    name: "some_numbers".to_owned(),
                    query: "num\nbers\n".to_owned(),
                },
                ProcedureDefinition {
                    name: "last".to_owned(),
                    query: "numbers\n".to_owned(),
                },
            ]
        );
    }

    #[test]
    fn name_without_query_is_dropped() {
        assert!(parse_definitions("lonely\n").is_empty());
    }

    #[test]
    fn registry_resolves_replaces_and_removes() {
        let registry = InMemoryProcedureRegistry::new();
        let engine = numbers_engine();

        registry.register(Arc::new(QueryProcedure::new("p", "numbers", Arc::clone(&engine))));
        registry.register(Arc::new(QueryProcedure::new("p", "other", engine)));
        assert_eq!(registry.len(), 1);

        let resolved = registry.resolve("p").expect("procedure should be registered");
        assert_eq!(resolved.name(), "p");

        assert!(registry.remove("p"));
        assert!(!registry.remove("p"));
        assert!(registry.resolve("p").is_none());
    }

    #[test]
    fn query_procedure_paginates_engine_result() {
        let procedure = QueryProcedure::new("page", "numbers", numbers_engine());
        let mut parameters = ParameterMap::new();
        parameters.insert("start".to_owned(), Value::from(3));
        parameters.insert("size".to_owned(), Value::from(4));

        let page = procedure
            .invoke(&parameters)
            .expect("invoke should succeed")
            .expect("query procedures always return rows");
        assert_eq!(page.first, 3);
        assert_eq!(page.max, Some(4));
        assert_eq!(page.total, 10);
        assert_eq!(page.rows.len(), 4);
    }

    #[test]
    fn query_procedure_wraps_engine_errors() {
        let procedure = QueryProcedure::new("broken", "missing_table", numbers_engine());
        let err = procedure
            .invoke(&ParameterMap::new())
            .err()
            .expect("unknown table should fail");
        assert_eq!(
            err.to_string(),
            "failed to execute query:\nunknown table 'missing_table'"
        );
    }

    #[test]
    fn native_procedure_can_return_nothing() {
        let procedure = NativeProcedure::new("noop", |_| Ok(None));
        assert!(procedure
            .invoke(&ParameterMap::new())
            .expect("noop succeeds")
            .is_none());
    }

    #[test]
    fn request_id_counts_per_type() {
        let procedure = request_id_procedure();
        let call = |kind: &str| {
            let mut parameters = ParameterMap::new();
            parameters.insert("type".to_owned(), Value::from(kind));
            procedure
                .invoke(&parameters)
                .expect("request_id succeeds")
                .expect("request_id returns a row")
                .rows[0][0]
                .clone()
        };

        assert_eq!(call("person"), Value::from("person:0"));
        assert_eq!(call("person"), Value::from("person:1"));
        assert_eq!(call("group"), Value::from("group:0"));

        let err = procedure
            .invoke(&ParameterMap::new())
            .err()
            .expect("type is required");
        assert!(matches!(err, ProcedureError::MissingParameter { name: "type" }));
    }

    #[test]
    fn registers_definition_files_and_skips_missing_ones() {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("graphwire-procedures-{nonce}.txt"));
        std::fs::write(&path, "all\nnumbers\n\nagain\nnumbers\n").expect("should write file");

        let registry = InMemoryProcedureRegistry::new();
        let (logger, sink) = memory_logger(LogLevel::Info);
        let files = vec![
            path.display().to_string(),
            "/definitely/not/here.txt".to_owned(),
        ];

        let count = register_definition_files(&files, &registry, &numbers_engine(), &logger);
        assert_eq!(count, 2);
        assert_eq!(registry.names(), vec!["again", "all"]);
        assert!(sink.contains("Could not load procedure definition file"));

        let _ = std::fs::remove_file(path);
    }
}
