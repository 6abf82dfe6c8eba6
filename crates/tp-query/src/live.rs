//! # Live-Match Broadcaster
//!
//! Matches freshly ingested lines against every active subscription and
//! forwards hits to the subscriber's [`LiveSink`].
//!
//! Each subscription owns a bounded queue drained by its own forwarding task,
//! so a slow sink only loses its own events and never stalls ingestion.

use crate::compiler::compile;
use crate::error::CompileError;
use crate::format::{format_live_event, format_record};
use crate::plan::QueryPlan;
use crate::predicate::matching_record;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub type SubscriptionId = String;

pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Per-subscription queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Receives `{"type":"log","data":..}` events for one subscription.
#[async_trait]
pub trait LiveSink: Send + Sync + 'static {
    async fn deliver(&self, event: String) -> Result<(), SinkError>;
}

struct Subscription {
    plan: Arc<QueryPlan>,
    queue: mpsc::Sender<String>,
    cancel: CancellationToken,
}

pub struct LiveBroadcaster {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    queue_capacity: usize,
    shutdown: CancellationToken,
}

impl Default for LiveBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl LiveBroadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Compile `sql` and register a subscription for it.
    pub async fn subscribe(
        &self,
        sql: &str,
        sink: Arc<dyn LiveSink>,
    ) -> Result<SubscriptionId, CompileError> {
        let plan = compile(sql)?;
        Ok(self.subscribe_plan(Arc::new(plan), sink).await)
    }

    pub async fn subscribe_plan(&self, plan: Arc<QueryPlan>, sink: Arc<dyn LiveSink>) -> SubscriptionId {
        let id = uuid::Uuid::new_v4().to_string();
        let (queue, mut rx) = mpsc::channel::<String>(self.queue_capacity);
        let cancel = self.shutdown.child_token();

        let forwarder_id = id.clone();
        let forwarder_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = forwarder_cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let Err(e) = sink.deliver(event).await {
                    tracing::warn!(subscription = %forwarder_id, error = %e, "sink failed, ending subscription");
                    break;
                }
            }
            tracing::debug!(subscription = %forwarder_id, "forwarder stopped");
        });

        {
            let mut subscriptions = self.subscriptions.write().await;
            subscriptions.insert(id.clone(), Subscription { plan, queue, cancel });
        }
        tracing::info!(subscription = %id, "live subscription added");
        id
    }

    /// Returns false when `id` was not registered.
    pub async fn unsubscribe(&self, id: &str) -> bool {
        let removed = {
            let mut subscriptions = self.subscriptions.write().await;
            subscriptions.remove(id)
        };
        match removed {
            Some(subscription) => {
                subscription.cancel.cancel();
                tracing::info!(subscription = %id, "live subscription removed");
                true
            }
            None => false,
        }
    }

    /// Offers one raw line from `source` to every subscription and returns
    /// how many queued it. Subscriptions whose forwarder has stopped are
    /// dropped.
    pub async fn ingest(&self, source: &str, line: &str) -> usize {
        let mut delivered = 0;
        let mut stale = Vec::new();

        let subscriptions = self.subscriptions.read().await;
        for (id, subscription) in subscriptions.iter() {
            if subscription.queue.is_closed() {
                stale.push(id.clone());
                continue;
            }
            let plan = &subscription.plan;
            if !plan.reads_source(source) {
                continue;
            }
            let Some(record) = matching_record(plan, line.as_bytes()) else {
                continue;
            };
            let event = format_live_event(&format_record(plan, line.as_bytes(), &record));

            match subscription.queue.try_send(event) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(subscription = %id, "subscriber queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => stale.push(id.clone()),
            }
        }
        drop(subscriptions);

        if !stale.is_empty() {
            let mut subscriptions = self.subscriptions.write().await;
            for id in stale {
                if subscriptions.remove(&id).is_some() {
                    tracing::info!(subscription = %id, "live subscription dropped, forwarder stopped");
                }
            }
        }

        delivered
    }

    pub async fn len(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stops every forwarder and forgets all subscriptions.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut subscriptions = self.subscriptions.write().await;
        let count = subscriptions.len();
        subscriptions.clear();
        tracing::info!(subscriptions = count, "live broadcaster shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct ChannelSink(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl LiveSink for ChannelSink {
        async fn deliver(&self, event: String) -> Result<(), SinkError> {
            self.0.send(event).map_err(|e| e.to_string().into())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl LiveSink for FailingSink {
        async fn deliver(&self, _event: String) -> Result<(), SinkError> {
            Err("connection reset".into())
        }
    }

    struct StuckSink;

    #[async_trait]
    impl LiveSink for StuckSink {
        async fn deliver(&self, _event: String) -> Result<(), SinkError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn channel_sink() -> (Arc<dyn LiveSink>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelSink(tx)), rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_matching_line_is_delivered_once() {
        let live = LiveBroadcaster::default();
        let (sink, mut rx) = channel_sink();
        live.subscribe("SELECT * FROM app WHERE line.level = 'error'", sink)
            .await
            .unwrap();

        let (other_sink, mut other_rx) = channel_sink();
        live.subscribe("SELECT * FROM worker WHERE line.level = 'error'", other_sink)
            .await
            .unwrap();

        let line = r#"{"line":{"level":"error"}}"#;
        assert_eq!(live.ingest("app", line).await, 1);
        assert_eq!(live.ingest("app", r#"{"line":{"level":"info"}}"#).await, 0);

        assert_eq!(
            recv(&mut rx).await,
            r#"{"type":"log","data":{"line":{"level":"error"}}}"#
        );
        assert!(rx.try_recv().is_err());

        tokio::task::yield_now().await;
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_sink_is_dropped_from_registry() {
        let live = LiveBroadcaster::default();
        live.subscribe("SELECT * FROM app", Arc::new(FailingSink))
            .await
            .unwrap();
        assert_eq!(live.ingest("app", r#"{"n":1}"#).await, 1);

        // The forwarder exits on the failed delivery and closes its queue.
        tokio::time::timeout(Duration::from_secs(2), async {
            while live.ingest("app", r#"{"n":2}"#).await > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert!(live.is_empty().await);
    }

    #[tokio::test]
    async fn test_projection_applies_to_live_events() {
        let live = LiveBroadcaster::default();
        let (sink, mut rx) = channel_sink();
        live.subscribe("SELECT line.cmd AS command FROM * WHERE line.cmd LIKE 'ls%'", sink)
            .await
            .unwrap();

        assert_eq!(live.ingest("any", r#"{"line":{"cmd":"ls -la","user":"x"}}"#).await, 1);
        assert_eq!(
            recv(&mut rx).await,
            r#"{"type":"log","data":{"command":"ls -la"}}"#
        );
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let live = LiveBroadcaster::default();
        let (sink, _rx) = channel_sink();
        let id = live.subscribe("SELECT * FROM app", sink).await.unwrap();
        assert_eq!(live.len().await, 1);

        assert!(live.unsubscribe(&id).await);
        assert!(!live.unsubscribe(&id).await);
        assert!(live.is_empty().await);
        assert_eq!(live.ingest("app", "{}").await, 0);
    }

    #[tokio::test]
    async fn test_slow_sink_drops_instead_of_blocking() {
        let live = LiveBroadcaster::new(1);
        live.subscribe("SELECT * FROM app", Arc::new(StuckSink))
            .await
            .unwrap();

        let mut queued = 0;
        for _ in 0..5 {
            queued += live.ingest("app", r#"{"n":1}"#).await;
        }
        assert!(queued <= 2);
    }

    #[tokio::test]
    async fn test_invalid_query_is_rejected() {
        let live = LiveBroadcaster::default();
        let (sink, _rx) = channel_sink();
        assert!(live.subscribe("SELECT * FROM", sink).await.is_err());
        assert!(live.is_empty().await);
    }

    #[tokio::test]
    async fn test_shutdown_clears_subscriptions() {
        let live = LiveBroadcaster::default();
        let (sink, _rx) = channel_sink();
        live.subscribe("SELECT * FROM app", sink).await.unwrap();
        live.shutdown().await;
        assert!(live.is_empty().await);
    }
}
