//! Property tests for aggregation idempotence and watermark monotonicity.

use std::sync::Arc;

use chanpulse_core::config::BatchConfig;
use chanpulse_core::{ChannelId, RawEvent};
use chanpulse_ingest::testkit::wire_event;
use chanpulse_ingest::{BatchProcessor, MemoryMetricsStore, MetricsStore};
use futures_util::stream;
use proptest::prelude::*;
use tokio::runtime::{Builder, Runtime};

fn runtime() -> Runtime {
    Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("create runtime")
}

fn raw(channel: i64, id: i64) -> RawEvent {
    RawEvent::from_wire(ChannelId::new(channel), &wire_event(id)).expect("valid event")
}

// Channel in 1..=3, id in 1..=200; duplicates are intended.
fn events_strategy() -> impl Strategy<Value = Vec<(i64, i64)>> {
    proptest::collection::vec((1..=3_i64, 1..=200_i64), 1..120)
}

#[derive(Debug, Clone)]
enum WatermarkOp {
    Commit { channel: i64, to: i64 },
    Advance { channel: i64, to: i64 },
    StaleCommit { channel: i64, to: i64 },
}

fn op_strategy() -> impl Strategy<Value = WatermarkOp> {
    prop_oneof![
        (1..=2_i64, 0..500_i64).prop_map(|(channel, to)| WatermarkOp::Commit { channel, to }),
        (1..=2_i64, 0..500_i64).prop_map(|(channel, to)| WatermarkOp::Advance { channel, to }),
        (1..=2_i64, 0..500_i64).prop_map(|(channel, to)| WatermarkOp::StaleCommit { channel, to }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    /// Replaying any event set leaves the stored rows untouched.
    #[test]
    fn prop_replay_is_idempotent(events in events_strategy()) {
        let rt = runtime();
        let (first, second) = rt.block_on(async {
            let store = Arc::new(MemoryMetricsStore::new());
            let processor = BatchProcessor::new(store.clone(), BatchConfig::default());
            let batch: Vec<RawEvent> = events.iter().map(|&(c, id)| raw(c, id)).collect();

            processor.process(stream::iter(batch.clone())).await;
            let first = store.rows();
            processor.process(stream::iter(batch)).await;
            (first, store.rows())
        });
        prop_assert_eq!(first, second);
    }

    /// Splitting history into ascending halves gives the same rows as one pass.
    #[test]
    fn prop_split_matches_whole(events in events_strategy(), cut in 1..200_i64) {
        let rt = runtime();
        let (whole, split) = rt.block_on(async {
            let batch: Vec<RawEvent> = events.iter().map(|&(c, id)| raw(c, id)).collect();

            let whole_store = Arc::new(MemoryMetricsStore::new());
            BatchProcessor::new(whole_store.clone(), BatchConfig::default())
                .process(stream::iter(batch.clone()))
                .await;

            let split_store = Arc::new(MemoryMetricsStore::new());
            let processor = BatchProcessor::new(split_store.clone(), BatchConfig::default());
            let (early, late): (Vec<_>, Vec<_>) = batch.into_iter().partition(|e| e.event_id <= cut);
            processor.process(stream::iter(early)).await;
            processor.process(stream::iter(late)).await;

            (whole_store.rows(), split_store.rows())
        });
        prop_assert_eq!(whole.len(), split.len());
        for (a, b) in whole.iter().zip(&split) {
            prop_assert_eq!(a.key(), b.key());
            prop_assert_eq!(a.sample_count, b.sample_count);
            prop_assert!((a.value - b.value).abs() <= 1e-9 * a.value.abs().max(1.0), "{:?}: {} vs {}", a.key(), a.value, b.value);
        }
    }

    /// No sequence of writes moves a watermark backwards.
    #[test]
    fn prop_watermark_never_regresses(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let rt = runtime();
        let history = rt.block_on(async {
            let store = MemoryMetricsStore::new();
            let mut history: Vec<(i64, i64)> = Vec::new();
            for op in ops {
                let channel = match op {
                    WatermarkOp::Commit { channel, to } => {
                        let ch = ChannelId::new(channel);
                        let current = current(&store, ch).await;
                        store.commit_batch(ch, &[], current, to).await.ok();
                        channel
                    }
                    WatermarkOp::Advance { channel, to } => {
                        let ch = ChannelId::new(channel);
                        let current = current(&store, ch).await;
                        store.advance_watermark(ch, current, to).await.ok();
                        channel
                    }
                    WatermarkOp::StaleCommit { channel, to } => {
                        let ch = ChannelId::new(channel);
                        let stale = current(&store, ch).await - 1;
                        let result = store.commit_batch(ch, &[], stale, to).await;
                        assert!(result.is_err(), "stale expectation must be rejected");
                        channel
                    }
                };
                history.push((channel, current(&store, ChannelId::new(channel)).await));
            }
            history
        });

        for channel in 1..=2 {
            let marks: Vec<i64> = history
                .iter()
                .filter(|(c, _)| *c == channel)
                .map(|(_, mark)| *mark)
                .collect();
            prop_assert!(marks.windows(2).all(|w| w[0] <= w[1]), "channel {}: {:?}", channel, marks);
        }
    }
}

async fn current(store: &MemoryMetricsStore, channel: ChannelId) -> i64 {
    store
        .watermark(channel)
        .await
        .expect("read watermark")
        .map_or(0, |w| w.last_event_id)
}
