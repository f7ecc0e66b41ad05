//! Log filters: boolean Rhai expressions evaluated against each log event.
//!
//! A filter that evaluates to `true` drops the event. The expression sees:
//!
//! - `msg`: the formatted message
//! - `level`: `"TRACE"`, `"DEBUG"`, `"INFO"`, `"WARN"` or `"ERROR"`
//! - `target`: the module path that emitted the event
//! - `attrs`: a map of the remaining structured fields, as strings
//! - `time`: seconds since the Unix epoch
//!
//! ```text
//! level == "DEBUG" && attrs["path"] == "/healthz"
//! ```

use arc_swap::ArcSwap;
use metrics::{counter, histogram};
use rhai::{Dynamic, Engine, EvalAltResult, Map, Scope, AST};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::metrics::{LOG_FILTER_ERRORS, LOG_FILTER_EXECUTION_TIME, LOG_FILTER_INVOCATIONS};

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("expression is empty")]
    Empty,
    #[error("{0}")]
    Parse(#[from] rhai::ParseError),
}

fn engine() -> &'static Engine {
    static ENGINE: OnceLock<Engine> = OnceLock::new();
    ENGINE.get_or_init(|| {
        let mut engine = Engine::new();
        engine.set_max_operations(10_000);
        engine.set_max_expr_depths(32, 32);
        engine.set_max_string_size(64 * 1024);
        engine
    })
}

/// A named, compiled filter expression.
pub struct CompiledFilter {
    name: String,
    ast: AST,
}

impl fmt::Debug for CompiledFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFilter")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl CompiledFilter {
    pub fn compile(name: &str, expression: &str) -> Result<Self, FilterError> {
        if expression.trim().is_empty() {
            return Err(FilterError::Empty);
        }

        let ast = engine().compile_expression(expression)?;
        Ok(Self {
            name: name.to_string(),
            ast,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluate against a record. Non-boolean results are errors.
    pub fn matches(&self, record: &LogRecord) -> Result<bool, Box<EvalAltResult>> {
        let mut attrs = Map::new();
        for (key, value) in &record.attrs {
            attrs.insert(key.as_str().into(), Dynamic::from(value.clone()));
        }

        let mut scope = Scope::new();
        scope.push_constant("msg", record.message.clone());
        scope.push_constant("level", record.level.clone());
        scope.push_constant("target", record.target.clone());
        scope.push_constant("attrs", attrs);
        scope.push_constant("time", record.time);

        engine().eval_ast_with_scope::<bool>(&mut scope, &self.ast)
    }
}

/// The fields of a log event as presented to filter expressions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRecord {
    pub time: i64,
    pub level: String,
    pub target: String,
    pub message: String,
    pub attrs: BTreeMap<String, String>,
}

impl LogRecord {
    pub fn from_event(event: &Event<'_>) -> Self {
        let metadata = event.metadata();
        let mut record = LogRecord {
            time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or_default(),
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            ..Default::default()
        };
        event.record(&mut record);
        record
    }
}

impl Visit for LogRecord {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.attrs.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let value = format!("{value:?}");
        if field.name() == "message" {
            self.message = value;
        } else {
            self.attrs.insert(field.name().to_string(), value);
        }
    }
}

/// The active filter set, shared between the tracing layer and the router so
/// a config reload replaces filters without rebuilding the subscriber.
#[derive(Clone, Default)]
pub struct LogFilters {
    active: Arc<ArcSwap<Vec<CompiledFilter>>>,
}

impl fmt::Debug for LogFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogFilters")
            .field("active", &self.active.load().len())
            .finish()
    }
}

impl LogFilters {
    pub fn replace(&self, filters: Vec<CompiledFilter>) {
        self.active.store(Arc::new(filters));
    }

    pub fn len(&self) -> usize {
        self.active.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any filter asks to drop the record. Evaluation errors keep it.
    pub fn should_drop(&self, record: &LogRecord) -> bool {
        let filters = self.active.load();
        for filter in filters.iter() {
            let started = Instant::now();
            let result = filter.matches(record);
            let name = filter.name.clone();
            counter!(LOG_FILTER_INVOCATIONS, "name" => name.clone()).increment(1);
            histogram!(LOG_FILTER_EXECUTION_TIME, "name" => name.clone())
                .record(started.elapsed().as_secs_f64() * 1_000_000.0);

            match result {
                Ok(true) => return true,
                Ok(false) => {}
                Err(_) => counter!(LOG_FILTER_ERRORS, "name" => name).increment(1),
            }
        }
        false
    }
}

/// Tracing layer that disables events matched by the active filters.
///
/// Nothing is logged from inside the layer; failures only show up as metrics.
#[derive(Debug, Clone)]
pub struct FilterLayer {
    filters: LogFilters,
}

impl FilterLayer {
    pub fn new(filters: LogFilters) -> Self {
        Self { filters }
    }
}

impl<S: Subscriber> Layer<S> for FilterLayer {
    fn event_enabled(&self, event: &Event<'_>, _ctx: Context<'_, S>) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        !self.filters.should_drop(&LogRecord::from_event(event))
    }
}
