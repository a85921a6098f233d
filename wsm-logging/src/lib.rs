//! Tracing setup shared by the wsm binaries.
//!
//! Configuration comes from the environment:
//!
//! - `RUST_LOG` or `LOG_LEVEL` (default `info`) select the filter.
//! - `LOG_OUTPUT` is `console`, `file` or `both`.
//! - `LOG_FORMAT` is `human` or `json`.
//! - `LOG_FILE_PATH` names the daily rolling log file.
//! - `LOG_FOCUS` is a comma separated list of `key:value` pairs. When set,
//!   only events inside spans carrying every listed field are kept, e.g.
//!   `LOG_FOCUS=machine_id:3f2a` or `LOG_FOCUS=workspace_id:*`.

use std::{
    collections::HashMap,
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::{field::Visit, span, Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{writer::BoxMakeWriter, MakeWriter},
    layer::{Context, Layer},
    prelude::*,
    registry,
    registry::LookupSpan,
    EnvFilter,
};

const DEFAULT_LOG_FILE: &str = "/tmp/wsm.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

/// A `key:value` span field requirement; `*` matches any value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusTag {
    pub key: String,
    pub value: String,
}

impl FocusTag {
    fn matches(&self, value: Option<&String>) -> bool {
        value.is_some_and(|v| self.value == "*" || v.contains(&self.value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// `EnvFilter` directives.
    pub filter: String,
    pub output: LogOutput,
    pub format: LogFormat,
    pub file_path: PathBuf,
    pub focus: Vec<FocusTag>,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let filter = match lookup("RUST_LOG").filter(|s| !s.trim().is_empty()) {
            Some(directives) => directives,
            None => {
                let level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
                format!("{level},hyper=warn,sqlx=warn")
            }
        };

        let output = match lookup("LOG_OUTPUT").as_deref() {
            Some("file") => LogOutput::File,
            Some("both") => LogOutput::Both,
            _ => LogOutput::Console,
        };

        let format = match lookup("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Human,
        };

        Self {
            filter,
            output,
            format,
            file_path: lookup("LOG_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE)),
            focus: lookup("LOG_FOCUS")
                .map(|s| parse_focus(&s))
                .unwrap_or_default(),
        }
    }
}

pub fn parse_focus(spec: &str) -> Vec<FocusTag> {
    spec.split(',')
        .filter_map(|part| {
            let (key, value) = part.split_once(':')?;
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some(FocusTag {
                key: key.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

// Writes every line to both sinks.
struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res_a = self.a.write_all(buf);
        let res_b = self.b.write_all(buf);
        res_a.and(res_b).map(|_| buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

struct MakeTee<A, B> {
    make_a: A,
    make_b: B,
}

impl<'a, A, B> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a>,
    B: MakeWriter<'a>,
{
    type Writer = Tee<A::Writer, B::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.make_a.make_writer(),
            b: self.make_b.make_writer(),
        }
    }
}

#[derive(Default)]
struct SpanFields(HashMap<String, String>);

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}

/// Drops events whose span scope lacks one of the focus fields.
struct FocusLayer {
    tags: Vec<FocusTag>,
}

impl<S> Layer<S> for FocusLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        if self.tags.is_empty() {
            return;
        }
        let Some(span) = ctx.span(id) else { return };
        let mut fields = SpanFields::default();
        attrs.record(&mut FieldVisitor(&mut fields.0));
        span.extensions_mut().insert(fields);
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        if self.tags.is_empty() {
            return;
        }
        let Some(span) = ctx.span(id) else { return };
        let mut extensions = span.extensions_mut();
        if let Some(fields) = extensions.get_mut::<SpanFields>() {
            values.record(&mut FieldVisitor(&mut fields.0));
        }
    }

    fn event_enabled(&self, event: &Event<'_>, ctx: Context<'_, S>) -> bool {
        if self.tags.is_empty() {
            return true;
        }

        // Events outside any span carry no fields to match.
        let Some(scope) = ctx.event_scope(event) else {
            return false;
        };

        let mut seen: HashMap<String, String> = HashMap::new();
        for span in scope {
            if let Some(fields) = span.extensions().get::<SpanFields>() {
                for (k, v) in &fields.0 {
                    seen.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }

        self.tags.iter().all(|tag| tag.matches(seen.get(&tag.key)))
    }
}

/// Install the global subscriber. Keep the returned guard alive for as long
/// as file logging should flush.
pub fn init_subscriber(settings: &LogSettings) -> Option<WorkerGuard> {
    let mut guard = None;

    let log_dir = settings
        .file_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("/tmp"));
    let log_filename = settings
        .file_path
        .file_name()
        .unwrap_or_else(|| "wsm.log".as_ref());

    let writer = match settings.output {
        LogOutput::Console => BoxMakeWriter::new(io::stdout),
        LogOutput::File => {
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(file_guard);
            BoxMakeWriter::new(non_blocking)
        }
        LogOutput::Both => {
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(file_guard);
            BoxMakeWriter::new(MakeTee {
                make_a: io::stdout,
                make_b: non_blocking,
            })
        }
    };

    let subscriber = registry()
        .with(EnvFilter::new(&settings.filter))
        .with(FocusLayer {
            tags: settings.focus.clone(),
        });
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(writer);

    let installed = match settings.format {
        LogFormat::Json => subscriber.with(fmt_layer.json()).try_init(),
        LogFormat::Human => subscriber.with(fmt_layer.pretty()).try_init(),
    };
    if installed.is_err() {
        eprintln!("wsm-logging: a global tracing subscriber is already installed");
    }

    guard
}
