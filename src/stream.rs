//! Event-stream processing: raw sport events in, per-event feature batches
//! out.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::models::{FeatureResponse, Record};
use crate::pipeline::FeaturePipeline;

/// One incoming event: the observations of a game moment for a sport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SportEvent {
    pub event_id: String,
    pub sport: String,
    pub rows: Vec<Record>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventFeatures {
    pub event_id: String,
    pub sport: String,
    pub responses: Vec<FeatureResponse>,
}

/// Consume events from `events` and emit one [`EventFeatures`] per event on
/// the returned channel.
///
/// Each event is processed in its own task, so a slow event never holds up
/// the next one and results may arrive out of input order. The output
/// channel closes once the input closes and every in-flight event is done.
pub fn start_feature_stream(
    pipeline: FeaturePipeline,
    mut events: mpsc::Receiver<SportEvent>,
) -> mpsc::Receiver<EventFeatures> {
    let (tx, rx) = mpsc::channel(1024);

    tokio::spawn(async move {
        info!("Feature stream started");
        let mut processed = 0u64;

        while let Some(event) = events.recv().await {
            processed += 1;
            let pipeline = pipeline.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let event_id = event.event_id.clone();
                let features = pipeline.compute_for_event(event).await;
                if tx.send(features).await.is_err() {
                    debug!("Feature stream consumer gone; dropping event {}", event_id);
                }
            });
        }

        info!("Feature stream input closed after {} event(s)", processed);
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FeatureCache;
    use crate::models::{record, Value};
    use crate::pipeline::{ClassPolicy, PipelinePolicy};
    use std::time::Duration;
    use crate::registry::FeatureRegistry;

    fn play(game: i64) -> Record {
        record([
            ("down", Value::Int(1)),
            ("distance", Value::Int(10)),
            ("yard_line", Value::Int(25)),
            ("yards_gained", Value::Int(6)),
            ("qb_id", Value::from("qb1")),
            ("game_no", Value::Int(game)),
            ("pressure", Value::Int(1)),
            ("sack", Value::Int(0)),
        ])
    }

    #[tokio::test]
    async fn test_stream_emits_one_batch_per_event() {
        let relaxed = ClassPolicy {
            cache_ttl: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
        };
        let pipeline = FeaturePipeline::new(
            FeatureRegistry::builtin().unwrap(),
            FeatureCache::in_memory(),
            PipelinePolicy {
                real_time: relaxed,
                near_real_time: relaxed,
                batch: relaxed,
                ..PipelinePolicy::default()
            },
        );
        let (tx, rx) = mpsc::channel(8);
        let mut out = start_feature_stream(pipeline, rx);

        for i in 0..3 {
            tx.send(SportEvent {
                event_id: format!("nfl-{}", i),
                sport: "football".into(),
                rows: vec![play(1), play(2)],
            })
            .await
            .unwrap();
        }
        tx.send(SportEvent {
            event_id: "x".into(),
            sport: "cricket".into(),
            rows: vec![],
        })
        .await
        .unwrap();
        drop(tx);

        let mut seen = Vec::new();
        while let Some(batch) = out.recv().await {
            seen.push(batch);
        }
        assert_eq!(seen.len(), 4);

        let mut ids: Vec<String> = seen.iter().map(|b| b.event_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["nfl-0", "nfl-1", "nfl-2", "x"]);

        for batch in &seen {
            if batch.sport == "football" {
                assert_eq!(batch.responses.len(), 3);
                for r in &batch.responses {
                    assert!(r.request_id.starts_with(&batch.event_id));
                    assert_eq!(r.output_values.len(), 2, "{}", r.feature_name);
                }
            } else {
                assert!(batch.responses.is_empty());
            }
        }
    }
}
