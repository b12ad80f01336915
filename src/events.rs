//! Progress notifications emitted during a case run.
//!
//! Events are delivered in execution order. Sinks decide where they go:
//! a channel for an interactive front end, a collector for tests or
//! headless runs, or the tracing log.

use crate::model::{CaseExecutionResult, StepResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    CaseStarted { case_name: String, total_steps: usize },
    StepStarted { step_order: u32, name: String },
    StepFinished { result: StepResult },
    CaseFinished { result: CaseExecutionResult },
    Log { level: LogLevel, message: String },
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ExecutionEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn emit(&self, _event: ExecutionEvent) {}
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ExecutionEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn emit(&self, event: ExecutionEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Forwards events into an unbounded channel.
///
/// A dropped receiver is not an error; the run keeps going.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: ExecutionEvent) {
        let _ = self.tx.send(event);
    }
}

/// Writes progress to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn emit(&self, event: ExecutionEvent) {
        match event {
            ExecutionEvent::CaseStarted {
                case_name,
                total_steps,
            } => info!("Case '{}' started ({} steps)", case_name, total_steps),
            ExecutionEvent::StepStarted { step_order, name } => {
                info!("Step {} '{}' started", step_order, name)
            }
            ExecutionEvent::StepFinished { result } => info!(
                "Step {} '{}' finished: {:?} ({} ms)",
                result.step_order,
                result.name,
                result.status,
                result.duration_ms
            ),
            ExecutionEvent::CaseFinished { result } => info!(
                "Case '{}' finished: {} ({} passed, {} failed, {} errored, \
                 {} skipped)",
                result.case_name,
                result.overall_status.as_str(),
                result.passed,
                result.failed,
                result.errored,
                result.skipped
            ),
            // Log events mirror tracing calls made at the source.
            ExecutionEvent::Log { .. } => {}
        }
    }
}

/// Emit a log event and write it to tracing at the matching level.
pub async fn log(sink: &dyn EventSink, level: LogLevel, message: String) {
    match level {
        LogLevel::Info => info!("{}", message),
        LogLevel::Warning => warn!("{}", message),
        LogLevel::Error => error!("{}", message),
    }
    sink.emit(ExecutionEvent::Log { level, message }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_preserves_order() {
        let (sink, mut rx) = ChannelSink::new();
        for i in 0..5 {
            sink.emit(ExecutionEvent::StepStarted {
                step_order: i,
                name: format!("s{i}"),
            })
            .await;
        }
        drop(sink);

        let mut orders = Vec::new();
        while let Some(event) = rx.recv().await {
            if let ExecutionEvent::StepStarted { step_order, .. } = event {
                orders.push(step_order);
            }
        }
        assert_eq!(orders, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_channel_sink_ignores_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(ExecutionEvent::Log {
            level: LogLevel::Info,
            message: "still fine".into(),
        })
        .await;
    }

    #[tokio::test]
    async fn test_log_helper_emits_event() {
        let sink = CollectingSink::new();
        log(&sink, LogLevel::Warning, "extraction missed".into()).await;
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ExecutionEvent::Log { level: LogLevel::Warning, message }
                if message == "extraction missed"
        ));
    }
}
