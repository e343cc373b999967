//! Batch shipping of finalized traces.

use std::time::Duration;

use parking_lot::Mutex;

use caprun_domain::config::TraceConfig;

use crate::collector::Trace;

const RETRY_BACKOFF_INITIAL_MS: u64 = 100;

/// Batches finalized traces and POSTs them to the configured endpoint
/// with bounded retries. Without an endpoint every operation is a
/// no-op.
pub struct TraceSyncer {
    endpoint: Option<String>,
    batch_size: usize,
    max_retries: u32,
    http: reqwest::Client,
    queue: Mutex<Vec<Trace>>,
}

impl TraceSyncer {
    pub fn new(config: &TraceConfig) -> Self {
        let endpoint = if config.endpoint.is_empty() {
            None
        } else {
            Some(config.endpoint.clone())
        };
        Self {
            endpoint,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            http: reqwest::Client::new(),
            queue: Mutex::new(Vec::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Enqueue a trace; ships automatically when a batch fills up.
    pub async fn push(&self, trace: Trace) {
        if self.endpoint.is_none() {
            return;
        }
        let ready = {
            let mut queue = self.queue.lock();
            queue.push(trace);
            queue.len() >= self.batch_size
        };
        if ready {
            self.flush().await;
        }
    }

    /// Number of traces waiting for the next batch.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Ship everything queued. A batch that keeps failing past the
    /// retry budget is dropped with a warning.
    pub async fn flush(&self) {
        let Some(endpoint) = &self.endpoint else {
            return;
        };
        let batch: Vec<Trace> = {
            let mut queue = self.queue.lock();
            std::mem::take(&mut *queue)
        };
        if batch.is_empty() {
            return;
        }

        let body = serde_json::json!({ "traces": batch });
        let mut backoff = Duration::from_millis(RETRY_BACKOFF_INITIAL_MS);

        for attempt in 0..=self.max_retries {
            match self.http.post(endpoint).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(count = batch.len(), "trace batch shipped");
                    return;
                }
                Ok(response) => {
                    tracing::warn!(
                        status = %response.status(),
                        attempt,
                        "trace endpoint rejected batch"
                    );
                }
                Err(error) => {
                    tracing::warn!(error = %error, attempt, "trace upload failed");
                }
            }
            if attempt < self.max_retries {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        tracing::warn!(count = batch.len(), "dropping trace batch after retries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn trace(capability: &str) -> Trace {
        Trace {
            capability: capability.into(),
            calls: vec![],
            branches: vec![],
            success: true,
            error: None,
            user_id: None,
            started_at: Utc::now(),
            finalized_at: Utc::now(),
        }
    }

    fn config(endpoint: &str, batch_size: usize, max_retries: u32) -> TraceConfig {
        TraceConfig {
            endpoint: endpoint.into(),
            batch_size,
            max_retries,
        }
    }

    #[tokio::test]
    async fn no_endpoint_is_noop() {
        let syncer = TraceSyncer::new(&config("", 1, 3));
        assert!(!syncer.is_enabled());
        syncer.push(trace("a.b.c.d")).await;
        assert_eq!(syncer.queued(), 0);
        syncer.flush().await;
    }

    #[tokio::test]
    async fn batch_fills_and_ships() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = format!("{}/ingest", server.uri());
        let syncer = TraceSyncer::new(&config(&endpoint, 2, 0));
        syncer.push(trace("one.a.b.c")).await;
        assert_eq!(syncer.queued(), 1);
        syncer.push(trace("two.a.b.c")).await;
        assert_eq!(syncer.queued(), 0);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = format!("{}/ingest", server.uri());
        let syncer = TraceSyncer::new(&config(&endpoint, 10, 2));
        syncer.push(trace("a.b.c.d")).await;
        syncer.flush().await;
        assert_eq!(syncer.queued(), 0);
    }

    #[tokio::test]
    async fn drops_batch_after_retry_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let endpoint = format!("{}/ingest", server.uri());
        let syncer = TraceSyncer::new(&config(&endpoint, 10, 1));
        syncer.push(trace("a.b.c.d")).await;
        syncer.flush().await;
        // The batch is gone either way; nothing re-queues.
        assert_eq!(syncer.queued(), 0);
    }
}
