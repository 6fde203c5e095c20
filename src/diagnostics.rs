//! Diagnostics bridge
//!
//! Forwards log records, including native llama.cpp logs routed through
//! `tracing`, to a process-wide sink installed by the embedding application.

use std::fmt::{self, Write as _};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt as fmt_layer, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<&Level> for LogLevel {
    fn from(level: &Level) -> Self {
        if *level == Level::ERROR {
            LogLevel::Error
        } else if *level == Level::WARN {
            LogLevel::Warn
        } else if *level == Level::INFO {
            LogLevel::Info
        } else if *level == Level::DEBUG {
            LogLevel::Debug
        } else {
            LogLevel::Trace
        }
    }
}

/// Receiver of forwarded log records
pub trait LogSink: Send + Sync {
    fn on_log(&self, level: LogLevel, text: &str);
}

impl<F> LogSink for F
where
    F: Fn(LogLevel, &str) + Send + Sync,
{
    fn on_log(&self, level: LogLevel, text: &str) {
        self(level, text)
    }
}

static SINK: RwLock<Option<Arc<dyn LogSink>>> = RwLock::new(None);

/// Installs `sink`, replacing any previous one.
///
/// Log events reach the sink only through [`SinkLayer`], which
/// [`init_tracing`] installs. Hosts with their own subscriber must add the
/// layer themselves; [`emit`] reaches the sink either way.
pub fn set_sink(sink: Arc<dyn LogSink>) {
    *SINK.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
}

/// Removes the active sink; records are dropped afterwards
pub fn clear_sink() {
    *SINK.write().unwrap_or_else(PoisonError::into_inner) = None;
}

pub fn has_sink() -> bool {
    SINK.read().unwrap_or_else(PoisonError::into_inner).is_some()
}

/// Sends one record to the active sink, if any
pub fn emit(level: LogLevel, text: &str) {
    // the sink may log itself, so it is called without holding the lock
    let sink = SINK.read().unwrap_or_else(PoisonError::into_inner).clone();
    if let Some(sink) = sink {
        sink.on_log(level, text);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// `tracing` layer forwarding events to the active sink
#[derive(Debug, Clone, Copy, Default)]
pub struct SinkLayer;

impl<S: Subscriber> Layer<S> for SinkLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if !has_sink() {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let meta = event.metadata();
        let text = format!("{}: {}{}", meta.target(), visitor.message, visitor.fields);
        emit(LogLevel::from(meta.level()), &text);
    }
}

#[derive(Debug, Error)]
pub enum DiagnosticsError {
    #[error("Invalid log directive: {0}")]
    InvalidDirective(#[from] tracing_subscriber::filter::ParseError),

    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// Installs the global subscriber: fmt output, `RUST_LOG` filtering with
/// `directive` added, and the sink layer.
pub fn init_tracing(directive: &str) -> Result<(), DiagnosticsError> {
    let filter = EnvFilter::from_default_env().add_directive(directive.parse()?);
    tracing_subscriber::registry()
        .with(fmt_layer::layer())
        .with(filter)
        .with(SinkLayer)
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// The sink is process-wide
    static SERIAL: Mutex<()> = Mutex::new(());

    fn recorder() -> (Arc<Mutex<Vec<(LogLevel, String)>>>, Arc<dyn LogSink>) {
        let records = Arc::new(Mutex::new(Vec::new()));
        let target = records.clone();
        let sink: Arc<dyn LogSink> = Arc::new(move |level: LogLevel, text: &str| {
            target.lock().unwrap().push((level, text.to_string()));
        });
        (records, sink)
    }

    #[test]
    fn test_last_writer_wins() {
        let _guard = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let (first, first_sink) = recorder();
        let (second, second_sink) = recorder();

        set_sink(first_sink);
        emit(LogLevel::Info, "one");
        set_sink(second_sink);
        emit(LogLevel::Warn, "two");
        clear_sink();
        emit(LogLevel::Error, "three");

        assert_eq!(*first.lock().unwrap(), vec![(LogLevel::Info, "one".to_string())]);
        assert_eq!(*second.lock().unwrap(), vec![(LogLevel::Warn, "two".to_string())]);
        assert!(!has_sink());
    }

    #[test]
    fn test_layer_forwards_events() {
        let _guard = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let (records, sink) = recorder();
        set_sink(sink);

        let subscriber = tracing_subscriber::registry().with(SinkLayer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(context = 3, "layer marker {}", 42);
            tracing::debug!("debug marker");
        });
        clear_sink();

        let records = records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, LogLevel::Warn);
        assert!(records[0].1.contains("layer marker 42"));
        assert!(records[0].1.contains("context=3"));
        assert_eq!(records[1].0, LogLevel::Debug);
    }

    #[test]
    fn test_invalid_directive() {
        assert!(matches!(
            init_tracing("ctxrt=verbose"),
            Err(DiagnosticsError::InvalidDirective(_))
        ));
    }
}
