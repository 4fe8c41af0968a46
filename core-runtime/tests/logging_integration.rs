//! Global subscriber installation

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::logging::{LogEntry, LogLevel, LoggerSink};
use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
use core_runtime::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct CollectingSink {
    entries: Mutex<Vec<LogEntry>>,
}

#[async_trait]
impl LoggerSink for CollectingSink {
    async fn log(&self, entry: LogEntry) -> BridgeResult<()> {
        self.entries.lock().await.push(entry);
        Ok(())
    }
}

async fn wait_for_entries(sink: &CollectingSink) -> Vec<LogEntry> {
    for _ in 0..50 {
        let entries = sink.entries.lock().await.clone();
        if !entries.is_empty() {
            return entries;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Vec::new()
}

// A process has one global subscriber, so the whole lifecycle is one test.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_init_logging_filters_and_forwards_once() {
    let sink = Arc::new(CollectingSink::default());
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Debug)
        .with_logger_sink(sink.clone());

    init_logging(config.clone()).unwrap();

    tracing::debug!(target: "core_sync::pull", "below the sink minimum");
    tracing::info!(target: "hyper::client", "held at warn by the default directives");
    tracing::info!(
        target: "core_sync::push",
        table = "todoitem",
        authorization = "Bearer abc",
        "Operation pushed"
    );

    let forwarded = wait_for_entries(&sink).await;

    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].message, "Operation pushed");
    assert_eq!(forwarded[0].fields.get("table").map(String::as_str), Some("todoitem"));
    assert_eq!(
        forwarded[0].fields.get("authorization").map(String::as_str),
        Some("[REDACTED]")
    );

    assert!(matches!(init_logging(config), Err(Error::Logging(_))));
}
