//! Per-channel shared video sources
//!
//! Each channel gets exactly one source, created from its first accepted
//! frame. Sessions waiting for it hold a watch receiver; publishing the
//! source is the one-shot readiness signal they await.
//!
//! A slot with no source and no watchers is dropped, and a channel's source
//! is retired when the channel goes away or the source stops accepting
//! frames.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};

use super::engine::{EngineError, VideoSource};
use crate::registry::ChannelId;

type Slot = watch::Sender<Option<Arc<dyn VideoSource>>>;

/// Receiver that resolves once a channel's source exists
pub type SourceWatch = watch::Receiver<Option<Arc<dyn VideoSource>>>;

/// Map of channel id to its shared source slot
#[derive(Default)]
pub struct SourceTable {
    slots: RwLock<HashMap<ChannelId, Slot>>,
}

impl SourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The channel's source, if one was created
    pub async fn get(&self, channel: &ChannelId) -> Option<Arc<dyn VideoSource>> {
        let slots = self.slots.read().await;
        let source = slots.get(channel)?.borrow().clone();
        source
    }

    /// Watch a channel's slot, creating an empty one if needed
    ///
    /// Creating a slot first sweeps every other empty slot nobody watches.
    pub async fn watch(&self, channel: &ChannelId) -> SourceWatch {
        if let Some(slot) = self.slots.read().await.get(channel) {
            return slot.subscribe();
        }

        let mut slots = self.slots.write().await;
        if !slots.contains_key(channel) {
            slots.retain(|_, slot| !is_idle(slot));
        }
        slots
            .entry(channel.clone())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Drop the channel's slot if it has no source and no watchers
    pub async fn prune(&self, channel: &ChannelId) {
        let mut slots = self.slots.write().await;
        if slots.get(channel).map(is_idle).unwrap_or(false) {
            slots.remove(channel);
        }
    }

    /// Release the channel's source
    ///
    /// Sessions still watching keep an empty slot and wake on the next
    /// source. Returns `true` if a source was released.
    pub async fn retire(&self, channel: &ChannelId) -> bool {
        self.retire_matching(channel, None).await
    }

    /// Release `source` if it is still the channel's current source
    pub async fn discard(&self, channel: &ChannelId, source: &Arc<dyn VideoSource>) -> bool {
        self.retire_matching(channel, Some(source)).await
    }

    async fn retire_matching(
        &self,
        channel: &ChannelId,
        expected: Option<&Arc<dyn VideoSource>>,
    ) -> bool {
        let mut slots = self.slots.write().await;
        let Some(slot) = slots.get(channel) else {
            return false;
        };

        let current = slot.borrow().clone();
        let released = match (current, expected) {
            (None, _) => false,
            (Some(current), Some(expected)) => Arc::ptr_eq(&current, expected),
            (Some(_), None) => true,
        };

        if released {
            slot.send_replace(None);
        }
        if is_idle(slot) {
            slots.remove(channel);
        }
        released
    }

    /// Return the channel's source, creating it with `init` if absent
    ///
    /// Creation runs under the table's write lock so concurrent callers never
    /// create two sources for one channel. The flag is `true` when this call
    /// created the source.
    pub async fn get_or_try_init<F, Fut>(
        &self,
        channel: &ChannelId,
        init: F,
    ) -> Result<(Arc<dyn VideoSource>, bool), EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn VideoSource>, EngineError>>,
    {
        if let Some(source) = self.get(channel).await {
            return Ok((source, false));
        }

        let mut slots = self.slots.write().await;
        let slot = slots
            .entry(channel.clone())
            .or_insert_with(|| watch::channel(None).0);

        let existing = slot.borrow().clone();
        if let Some(source) = existing {
            return Ok((source, false));
        }

        let source = init().await?;
        slot.send_replace(Some(Arc::clone(&source)));
        Ok((source, true))
    }

    /// Number of channels with a created source
    pub async fn len(&self) -> usize {
        self.slots
            .read()
            .await
            .values()
            .filter(|slot| slot.borrow().is_some())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    #[cfg(test)]
    pub(crate) async fn slots_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }
}

fn is_idle(slot: &Slot) -> bool {
    slot.borrow().is_none() && slot.receiver_count() == 0
}

/// Wait until a watched slot holds a source
///
/// Pends forever if the table is dropped first.
pub async fn ready(watch: &mut SourceWatch) -> Arc<dyn VideoSource> {
    let source = match watch.wait_for(Option::is_some).await {
        Ok(source) => source.clone(),
        Err(_) => None,
    };

    match source {
        Some(source) => source,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::time::Duration;

    use super::*;
    use crate::registry::{DecodedFrame, Resolution};

    struct NullSource(Resolution);

    impl VideoSource for NullSource {
        fn resolution(&self) -> Resolution {
            self.0
        }

        fn push_frame(&self, _frame: &DecodedFrame) -> Result<(), EngineError> {
            Ok(())
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn channel() -> ChannelId {
        ChannelId::new("cam-1").unwrap()
    }

    async fn make(res: Resolution) -> Result<Arc<dyn VideoSource>, EngineError> {
        Ok(Arc::new(NullSource(res)) as Arc<dyn VideoSource>)
    }

    #[tokio::test]
    async fn test_init_once() {
        let table = SourceTable::new();

        let (first, created) = table
            .get_or_try_init(&channel(), || make(Resolution::new(64, 48)))
            .await
            .unwrap();
        assert!(created);

        let (second, created) = table
            .get_or_try_init(&channel(), || make(Resolution::new(32, 32)))
            .await
            .unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.resolution(), Resolution::new(64, 48));
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_init_leaves_slot_empty() {
        let table = SourceTable::new();

        let result = table
            .get_or_try_init(&channel(), || async {
                Err(EngineError::Source("encoder unavailable".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(table.get(&channel()).await.is_none());
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_first_source() {
        let table = Arc::new(SourceTable::new());
        let mut watch = table.watch(&channel()).await;

        let waiter = tokio::spawn(async move { ready(&mut watch).await.resolution() });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        table
            .get_or_try_init(&channel(), || make(Resolution::new(64, 48)))
            .await
            .unwrap();

        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, Resolution::new(64, 48));
    }

    #[tokio::test]
    async fn test_watch_after_creation_is_ready() {
        let table = SourceTable::new();
        table
            .get_or_try_init(&channel(), || make(Resolution::new(8, 8)))
            .await
            .unwrap();

        let mut watch = table.watch(&channel()).await;
        let source = tokio::time::timeout(Duration::from_millis(100), ready(&mut watch))
            .await
            .unwrap();
        assert_eq!(source.resolution(), Resolution::new(8, 8));
    }

    #[tokio::test]
    async fn test_unwatched_slots_are_dropped() {
        let table = SourceTable::new();

        for n in 0..1000 {
            let id = ChannelId::new(&format!("ghost-{}", n)).unwrap();
            drop(table.watch(&id).await);
        }
        assert!(table.slots.read().await.len() <= 1);

        table.prune(&ChannelId::new("ghost-999").unwrap()).await;
        assert_eq!(table.slots.read().await.len(), 0);
    }

    #[tokio::test]
    async fn test_prune_keeps_watched_slot() {
        let table = SourceTable::new();
        let _watch = table.watch(&channel()).await;

        table.prune(&channel()).await;
        assert_eq!(table.slots.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_retire_releases_source() {
        let table = SourceTable::new();
        table
            .get_or_try_init(&channel(), || make(Resolution::new(8, 8)))
            .await
            .unwrap();

        assert!(table.retire(&channel()).await);
        assert!(table.get(&channel()).await.is_none());
        assert_eq!(table.slots.read().await.len(), 0);
        assert!(!table.retire(&channel()).await);
    }

    #[tokio::test]
    async fn test_waiter_survives_retire_and_gets_next_source() {
        let table = Arc::new(SourceTable::new());
        let (old, _) = table
            .get_or_try_init(&channel(), || make(Resolution::new(8, 8)))
            .await
            .unwrap();

        let mut watch = table.watch(&channel()).await;
        assert!(table.discard(&channel(), &old).await);

        // A stale handle no longer matches
        assert!(!table.discard(&channel(), &old).await);

        let waiter = tokio::spawn(async move { ready(&mut watch).await.resolution() });
        table
            .get_or_try_init(&channel(), || make(Resolution::new(16, 16)))
            .await
            .unwrap();

        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, Resolution::new(16, 16));
    }
}
