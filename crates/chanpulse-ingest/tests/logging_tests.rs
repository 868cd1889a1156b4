//! Structured log output of the aggregation fallback path.

use std::io::{self, Write};
use std::sync::Arc;

use chanpulse_core::config::BatchConfig;
use chanpulse_core::{ChannelId, RawEvent};
use chanpulse_ingest::testkit::wire_event;
use chanpulse_ingest::{BatchProcessor, MemoryMetricsStore};
use futures_util::stream;
use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn lines(&self) -> Vec<serde_json::Value> {
        let bytes = self.0.lock().clone();
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).expect("json log line"))
            .collect()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Capture {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[tokio::test(flavor = "current_thread")]
async fn batch_fallback_logs_a_structured_warning() {
    let capture = Capture::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(capture.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let store = Arc::new(MemoryMetricsStore::new());
    let channel = ChannelId::new(-1004);
    store.fail_batches_for(channel);
    let processor = BatchProcessor::new(store.clone(), BatchConfig::default());
    let events: Vec<RawEvent> = (1..=6)
        .map(|id| RawEvent::from_wire(channel, &wire_event(id)).expect("valid event"))
        .collect();

    let summary = processor.process(stream::iter(events)).await;
    assert_eq!(summary.retried_individually, 1);

    let lines = capture.lines();
    let warning = lines
        .iter()
        .find(|line| line["fields"]["message"] == "batch commit failed, writing rows individually")
        .expect("fallback warning logged");
    assert_eq!(warning["level"], "WARN");
    assert_eq!(warning["fields"]["channel_id"], "-1004");
    assert!(
        warning["fields"]["error"]
            .as_str()
            .is_some_and(|e| e.contains("injected")),
        "error field: {}",
        warning["fields"]["error"]
    );
}
