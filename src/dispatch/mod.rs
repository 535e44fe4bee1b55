use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use rmpv::Value;
use serde_json::json;

use crate::engine::{Pagination, QueryEngine, QueryError, ResultSet};
use crate::logging::{LogLevel, Logger};
use crate::metrics::Metrics;
use crate::procedures::{ProcedureError, ProcedureRegistry, QueryProcedure};
use crate::wire::envelope::{Envelope, MessageKind};
use crate::wire::session::auth::AuthProtocol;
use crate::wire::session::Session;

pub const NAME_PARAMETER: &str = "name";
pub const DIAGNOSTICS_KEY: &str = "diagnostics";
pub const METRICS_KEY: &str = "metrics";

/// Turns one decoded request into zero or more responses for the same session.
/// Implementations never fail: every problem becomes an `ERROR` envelope.
pub trait Handler: Send + Sync {
    fn handle(&self, session: &Session, request: &Envelope) -> Vec<Envelope>;
}

/// Server-wide switches reachable through `CONFIGURE`.
pub struct RuntimeToggles {
    logger: Arc<Logger>,
    metrics: Option<Arc<Metrics>>,
}

impl RuntimeToggles {
    pub fn new(logger: Arc<Logger>, metrics: Option<Arc<Metrics>>) -> Self {
        Self { logger, metrics }
    }

    /// Applies recognized boolean keys. Returns whether any key was applied.
    pub fn apply(&self, request: &Envelope) -> bool {
        let mut applied = false;

        if let Some(enabled) = request.parameter(DIAGNOSTICS_KEY).and_then(Value::as_bool) {
            self.logger.set_diagnostics(enabled);
            applied = true;
        }

        if let (Some(metrics), Some(enabled)) = (
            self.metrics.as_ref(),
            request.parameter(METRICS_KEY).and_then(Value::as_bool),
        ) {
            metrics.set_enabled(enabled);
            applied = true;
        }

        applied
    }
}

pub struct Dispatcher {
    auth: Arc<AuthProtocol>,
    registry: Arc<dyn ProcedureRegistry>,
    engine: Arc<dyn QueryEngine>,
    toggles: RuntimeToggles,
    logger: Arc<Logger>,
}

impl Dispatcher {
    pub fn new(
        auth: Arc<AuthProtocol>,
        registry: Arc<dyn ProcedureRegistry>,
        engine: Arc<dyn QueryEngine>,
        toggles: RuntimeToggles,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            auth,
            registry,
            engine,
            toggles,
            logger,
        }
    }

    fn call_procedure(&self, request: &Envelope) -> Envelope {
        let name = request.payload_text();
        let Some(procedure) = self.registry.resolve(&name) else {
            return Envelope::error(request.id, format!("stored procedure '{name}' not found"));
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| procedure.invoke(&request.parameters)))
            .unwrap_or_else(|panic_payload| {
                Err(ProcedureError::Failed(format!(
                    "stored procedure '{name}' panicked: {}",
                    panic_message(panic_payload.as_ref())
                )))
            });

        match outcome {
            Ok(Some(result)) => Envelope::result(request.id, result.to_value()),
            Ok(None) => Envelope::success(request.id),
            Err(err) => {
                self.log_failure("Stored procedure failed", request, &err.to_string());
                Envelope::error(request.id, err.to_string())
            }
        }
    }

    fn direct_query(&self, request: &Envelope) -> Envelope {
        let Some(query) = request.payload_str() else {
            return Envelope::error(request.id, "failed to execute query: query text missing");
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<ResultSet, QueryError> {
            let page = Pagination::from_parameters(&request.parameters)?;
            let result = self.engine.execute(query, &request.parameters)?;
            Ok(ResultSet::paginate(result, page))
        }))
        .unwrap_or_else(|panic_payload| {
            Err(QueryError::Execution(format!(
                "engine panicked: {}",
                panic_message(panic_payload.as_ref())
            )))
        });

        match outcome {
            Ok(result) => Envelope::result(request.id, result.to_value()),
            Err(err) => {
                let message = format!("failed to execute query: {err}");
                self.log_failure("Direct query failed", request, &message);
                Envelope::error(request.id, message)
            }
        }
    }

    fn store_procedure(&self, request: &Envelope) -> Envelope {
        let Some(name) = request.string_parameter(NAME_PARAMETER).filter(|n| !n.is_empty()) else {
            return Envelope::error(request.id, "stored procedure name missing");
        };
        let Some(query) = request.payload_str().filter(|q| !q.is_empty()) else {
            return Envelope::error(request.id, "stored procedure query missing");
        };

        self.registry.register(Arc::new(QueryProcedure::new(
            name,
            query,
            Arc::clone(&self.engine),
        )));
        self.logger.log(
            LogLevel::Debug,
            Some("dispatch"),
            "Stored procedure",
            Some(json!({"name": name})),
        );
        Envelope::success(request.id)
    }

    fn delete_procedure(&self, request: &Envelope) -> Envelope {
        let name = request.payload_text();
        let removed = self.registry.remove(&name);
        self.logger.log(
            LogLevel::Debug,
            Some("dispatch"),
            "Deleted procedure",
            Some(json!({"name": name, "existed": removed})),
        );
        Envelope::success(request.id)
    }

    fn log_failure(&self, message: &str, request: &Envelope, error: &str) {
        self.logger.log(
            LogLevel::Warn,
            Some("dispatch"),
            message,
            Some(json!({"id": request.id, "kind": request.kind.as_str(), "error": error})),
        );
    }
}

impl Handler for Dispatcher {
    fn handle(&self, session: &Session, request: &Envelope) -> Vec<Envelope> {
        if self.logger.is_enabled(LogLevel::Verbose) {
            self.logger.log(
                LogLevel::Verbose,
                Some("dispatch"),
                "Handling request",
                Some(json!({
                    "session_id": session.id().to_string(),
                    "id": request.id,
                    "kind": request.kind.as_str(),
                })),
            );
        }

        if !session.is_authenticated() && !request.kind.allowed_unauthenticated() {
            return vec![Envelope::error(request.id, "authentication required")];
        }

        match request.kind {
            MessageKind::ProcedureCall => vec![self.call_procedure(request)],
            MessageKind::DirectQuery => vec![self.direct_query(request)],
            MessageKind::Ping => vec![Envelope::pong(request.id)],
            MessageKind::Pong => Vec::new(),
            MessageKind::StoreProcedure => vec![self.store_procedure(request)],
            MessageKind::DeleteProcedure => vec![self.delete_procedure(request)],
            MessageKind::Authenticate => self.auth.authenticate(session, request),
            MessageKind::Configure => {
                if self.toggles.apply(request) {
                    vec![Envelope::success(request.id)]
                } else {
                    Vec::new()
                }
            }
            MessageKind::Error => {
                self.logger.log(
                    LogLevel::Warn,
                    Some("dispatch"),
                    &format!("query {}: {}", request.id, request.payload_text()),
                    Some(json!({"session_id": session.id().to_string()})),
                );
                Vec::new()
            }
            MessageKind::Result | MessageKind::Success => vec![Envelope::error(
                request.id,
                format!("unknown query type: {}", request.kind),
            )],
        }
    }
}

/// Records request counts and query timings around any handler.
pub struct InstrumentedHandler {
    inner: Arc<dyn Handler>,
    metrics: Arc<Metrics>,
}

impl InstrumentedHandler {
    pub fn new(inner: Arc<dyn Handler>, metrics: Arc<Metrics>) -> Self {
        Self { inner, metrics }
    }
}

impl Handler for InstrumentedHandler {
    fn handle(&self, session: &Session, request: &Envelope) -> Vec<Envelope> {
        self.metrics.record_request(request.kind);

        let started = Instant::now();
        let responses = self.inner.handle(session, request);

        if matches!(request.kind, MessageKind::DirectQuery | MessageKind::ProcedureCall) {
            self.metrics
                .record_timing(&request.payload_text(), started.elapsed());
        }

        responses
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
