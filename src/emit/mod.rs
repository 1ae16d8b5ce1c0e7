//! Downstream emission
//!
//! Committed items flow to downstream storage through the [`Emitter`]
//! boundary. The engine waits at most a short bounded window for the
//! emitter; failures are logged but never roll back a cache update. Dedup by
//! item id is the emitter side's responsibility; [`ChannelEmitter`] does a
//! best-effort pass so a simple consumer sees each id once.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::models::{CallType, NewsItem};

/// Downstream delivery boundary.
#[async_trait]
pub trait Emitter: Send + Sync {
    async fn emit(
        &self,
        source_id: &str,
        items: &[NewsItem],
        call_type: CallType,
    ) -> Result<(), String>;
}

/// Emitter that drops everything.
pub struct NullEmitter;

#[async_trait]
impl Emitter for NullEmitter {
    async fn emit(
        &self,
        _source_id: &str,
        _items: &[NewsItem],
        _call_type: CallType,
    ) -> Result<(), String> {
        Ok(())
    }
}

/// Emitter that logs each batch (the CLI default).
pub struct LogEmitter;

#[async_trait]
impl Emitter for LogEmitter {
    async fn emit(
        &self,
        source_id: &str,
        items: &[NewsItem],
        call_type: CallType,
    ) -> Result<(), String> {
        tracing::info!(
            source_id = %source_id,
            count = items.len(),
            call_type = %call_type,
            "Emitting items downstream"
        );
        Ok(())
    }
}

/// One emitted batch.
#[derive(Debug, Clone)]
pub struct EmitBatch {
    pub source_id: String,
    pub items: Vec<NewsItem>,
    pub call_type: CallType,
}

/// Emitter forwarding batches over a bounded channel, deduping by item id.
pub struct ChannelEmitter {
    tx: mpsc::Sender<EmitBatch>,
    seen: Mutex<HashSet<String>>,
}

impl ChannelEmitter {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EmitBatch>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                seen: Mutex::new(HashSet::new()),
            },
            rx,
        )
    }
}

#[async_trait]
impl Emitter for ChannelEmitter {
    async fn emit(
        &self,
        source_id: &str,
        items: &[NewsItem],
        call_type: CallType,
    ) -> Result<(), String> {
        let fresh: Vec<NewsItem> = {
            let mut seen = self.seen.lock().unwrap();
            items
                .iter()
                .filter(|item| seen.insert(item.id.clone()))
                .cloned()
                .collect()
        };
        if fresh.is_empty() {
            return Ok(());
        }
        self.tx
            .send(EmitBatch {
                source_id: source_id.to_string(),
                items: fresh,
                call_type,
            })
            .await
            .map_err(|e| format!("emit channel closed: {e}"))
    }
}
