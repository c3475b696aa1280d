//! Process-wide logging bootstrap for the tessel runtime.
//!
//! [`init_logging`] bridges `log` records into `tracing`, filters them through an
//! `EnvFilter` (`RUST_LOG`, then `TESSEL_LOG`, else `info`) and forwards each event
//! to an optional log hook as a [`RuntimeLogRecord`]. With traces enabled, span
//! enter/exit and closed-span durations reach an optional trace hook as
//! [`TraceEvent`]s, which is how `gpu.submit` and `gpu.readback` timings are
//! observed.

use once_cell::sync::{Lazy, OnceCell};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex};
use tracing::span;
use tracing::subscriber::DefaultGuard;
use tracing::Subscriber;
use tracing_log::LogTracer;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::{LookupSpan, SpanRef};
use tracing_subscriber::Layer;

pub const ENV_LOG_FILTER: &str = "TESSEL_LOG";
const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeLogRecord {
    pub ts: String,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<JsonValue>,
}

/// Chrome trace-event shaped record. `ph` is `B`/`E` for span enter/exit, `X` for a
/// closed span with `dur`, `i` for an instant event.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub name: String,
    pub cat: String,
    pub ph: String,
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dur: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<JsonValue>,
}

type LogHook = Arc<dyn Fn(&RuntimeLogRecord) + Send + Sync>;
type TraceHook = Arc<dyn Fn(&[TraceEvent]) + Send + Sync>;

static LOG_HOOK: Lazy<Mutex<Option<LogHook>>> = Lazy::new(|| Mutex::new(None));
static TRACE_HOOK: Lazy<Mutex<Option<TraceHook>>> = Lazy::new(|| Mutex::new(None));
static LOG_TRACER: OnceCell<()> = OnceCell::new();

/// Keeps a scoped subscriber alive when a global one was already installed.
pub struct LoggingGuard {
    _guard: Option<DefaultGuard>,
}

impl LoggingGuard {
    /// `true` when this call installed the process-wide subscriber.
    pub fn is_global(&self) -> bool {
        self._guard.is_none()
    }
}

#[derive(Clone, Debug, Default)]
pub struct LoggingOptions {
    pub enable_traces: bool,
    pub pid: i64,
    /// Used when neither `RUST_LOG` nor `TESSEL_LOG` is set.
    pub default_filter: Option<String>,
}

/// Install (or replace) the hook receiving every log record.
pub fn set_runtime_log_hook<F>(hook: F)
where
    F: Fn(&RuntimeLogRecord) + Send + Sync + 'static,
{
    if let Ok(mut slot) = LOG_HOOK.lock() {
        *slot = Some(Arc::new(hook));
    }
}

/// Install (or replace) the hook receiving trace events.
pub fn set_trace_hook<F>(hook: F)
where
    F: Fn(&[TraceEvent]) + Send + Sync + 'static,
{
    if let Ok(mut slot) = TRACE_HOOK.lock() {
        *slot = Some(Arc::new(hook));
    }
}

pub fn clear_hooks() {
    if let Ok(mut slot) = LOG_HOOK.lock() {
        *slot = None;
    }
    if let Ok(mut slot) = TRACE_HOOK.lock() {
        *slot = None;
    }
}

fn log_hook() -> Option<LogHook> {
    LOG_HOOK.lock().ok().and_then(|slot| slot.clone())
}

fn trace_hook() -> Option<TraceHook> {
    TRACE_HOOK.lock().ok().and_then(|slot| slot.clone())
}

fn env_filter(default_filter: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env(ENV_LOG_FILTER))
        .or_else(|_| EnvFilter::try_new(default_filter.unwrap_or(DEFAULT_FILTER)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

pub fn init_logging(opts: LoggingOptions) -> LoggingGuard {
    LOG_TRACER.get_or_init(|| {
        let _ = LogTracer::init();
    });

    let build_subscriber = || {
        let trace_layer = opts
            .enable_traces
            .then_some(TraceBridgeLayer { pid: opts.pid });
        tracing_subscriber::registry()
            .with(env_filter(opts.default_filter.as_deref()))
            .with(LogBridgeLayer)
            .with(trace_layer)
    };

    let guard = match tracing::subscriber::set_global_default(build_subscriber()) {
        Ok(()) => None,
        Err(_) => Some(tracing::subscriber::set_default(build_subscriber())),
    };
    LoggingGuard { _guard: guard }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn now_timestamp_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

struct LogBridgeLayer;

impl<S> Layer<S> for LogBridgeLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let Some(hook) = log_hook() else {
            return;
        };
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        let meta = event.metadata();
        let current = ctx.lookup_current();
        let record = RuntimeLogRecord {
            ts: now_rfc3339(),
            level: meta.level().to_string(),
            target: log_target(event),
            message: visitor
                .message
                .unwrap_or_else(|| meta.name().to_string()),
            span_id: current.as_ref().map(|s| s.id().into_u64().to_string()),
            span_name: current.as_ref().map(|s| s.name().to_string()),
            fields: visitor.fields.filter(|f| !f.is_empty()).map(JsonValue::Object),
        };
        hook(&record);
    }
}

// Events bridged from `log` carry their original target in a `log.target` field.
fn log_target(event: &tracing::Event<'_>) -> String {
    use tracing_log::NormalizeEvent;
    match event.normalized_metadata() {
        Some(meta) => meta.target().to_string(),
        None => event.metadata().target().to_string(),
    }
}

struct SpanTiming {
    start_micros: i64,
    fields: serde_json::Map<String, JsonValue>,
}

#[derive(Clone)]
struct TraceBridgeLayer {
    pid: i64,
}

impl TraceBridgeLayer {
    fn span_event<S>(&self, span: &SpanRef<'_, S>, phase: &str) -> TraceEvent
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let meta = span.metadata();
        TraceEvent {
            name: meta.name().to_string(),
            cat: meta.target().to_string(),
            ph: phase.to_string(),
            ts: now_timestamp_micros(),
            dur: None,
            pid: Some(self.pid),
            span_id: Some(span.id().into_u64().to_string()),
            args: None,
        }
    }
}

impl<S> Layer<S> for TraceBridgeLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = JsonVisitor::default();
        attrs.record(&mut visitor);
        span.extensions_mut().insert(SpanTiming {
            start_micros: now_timestamp_micros(),
            fields: visitor.fields.unwrap_or_default(),
        });
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let Some(hook) = trace_hook() else {
            return;
        };
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        let ev = TraceEvent {
            name: visitor
                .message
                .unwrap_or_else(|| event.metadata().name().to_string()),
            cat: log_target(event),
            ph: "i".to_string(),
            ts: now_timestamp_micros(),
            dur: None,
            pid: Some(self.pid),
            span_id: ctx.lookup_current().map(|s| s.id().into_u64().to_string()),
            args: visitor.fields.map(JsonValue::Object),
        };
        hook(&[ev]);
    }

    fn on_enter(&self, id: &span::Id, ctx: Context<'_, S>) {
        let Some(hook) = trace_hook() else {
            return;
        };
        if let Some(span) = ctx.span(id) {
            hook(&[self.span_event(&span, "B")]);
        }
    }

    fn on_exit(&self, id: &span::Id, ctx: Context<'_, S>) {
        let Some(hook) = trace_hook() else {
            return;
        };
        if let Some(span) = ctx.span(id) {
            hook(&[self.span_event(&span, "E")]);
        }
    }

    fn on_close(&self, id: span::Id, ctx: Context<'_, S>) {
        let Some(hook) = trace_hook() else {
            return;
        };
        let Some(span) = ctx.span(&id) else {
            return;
        };
        let mut ev = self.span_event(&span, "X");
        if let Some(timing) = span.extensions().get::<SpanTiming>() {
            ev.dur = Some(ev.ts - timing.start_micros);
            ev.ts = timing.start_micros;
            if !timing.fields.is_empty() {
                ev.args = Some(JsonValue::Object(timing.fields.clone()));
            }
        }
        hook(&[ev]);
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: Option<serde_json::Map<String, JsonValue>>,
}

impl JsonVisitor {
    fn insert(&mut self, field: &tracing::field::Field, value: JsonValue) {
        let name = field.name();
        if name == "message" {
            self.message = Some(match value {
                JsonValue::String(s) => s,
                other => other.to_string(),
            });
        } else if !name.starts_with("log.") {
            self.fields
                .get_or_insert_with(Default::default)
                .insert(name.to_string(), value);
        }
    }
}

impl tracing::field::Visit for JsonVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.insert(field, JsonValue::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.insert(field, JsonValue::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.insert(field, JsonValue::from(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.insert(field, JsonValue::from(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.insert(field, JsonValue::Bool(value));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.insert(field, JsonValue::from(value));
    }
}
