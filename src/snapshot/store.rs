use crate::catalog::HotMetadata;
use crate::snapshot::MetadataRef;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
struct Published {
    current: Arc<HotMetadata>,
    next_version_id: u32,
}

/// The process-wide latest committed snapshot.
///
/// The mutex is held only to clone, replace or bump; snapshot construction
/// happens outside it.
#[derive(Debug)]
pub struct MetadataStore {
    published: Mutex<Published>,
}

impl MetadataStore {
    pub fn new(initial: HotMetadata) -> Self {
        let next_version_id = initial.version_id() + 1;
        Self {
            published: Mutex::new(Published {
                current: Arc::new(initial),
                next_version_id,
            }),
        }
    }

    pub fn acquire(&self) -> MetadataRef {
        MetadataRef::from_shared(Arc::clone(&self.published.lock().current))
    }

    pub fn current_version(&self) -> u32 {
        self.published.lock().current.version_id()
    }

    pub fn next_version_id(&self) -> u32 {
        let mut published = self.published.lock();
        let id = published.next_version_id;
        published.next_version_id += 1;
        id
    }

    /// Installs `metadata` unless a newer version is already published.
    pub fn publish(&self, metadata: HotMetadata) -> bool {
        let version_id = metadata.version_id();
        let replaced = {
            let mut published = self.published.lock();
            if version_id <= published.current.version_id() {
                return false;
            }
            published.next_version_id = published.next_version_id.max(version_id + 1);
            std::mem::replace(&mut published.current, Arc::new(metadata))
        };
        info!(
            version_id,
            previous = replaced.version_id(),
            readers = Arc::strong_count(&replaced) - 1,
            "metadata published"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::MetadataStore;
    use crate::catalog::bootstrap::base_metadata;

    #[test]
    fn readers_keep_their_pinned_version() {
        let store = MetadataStore::new(base_metadata(1).expect("bootstrap"));
        let pinned = store.acquire();
        let version = store.next_version_id();
        assert_eq!(version, 2);
        assert!(store.publish(base_metadata(version).expect("bootstrap")));
        assert_eq!(pinned.version_id(), 1);
        assert_eq!(store.acquire().version_id(), 2);
    }

    #[test]
    fn stale_versions_are_not_published() {
        let store = MetadataStore::new(base_metadata(1).expect("bootstrap"));
        let older = store.next_version_id();
        let newer = store.next_version_id();
        assert!(store.publish(base_metadata(newer).expect("bootstrap")));
        assert!(!store.publish(base_metadata(older).expect("bootstrap")));
        assert_eq!(store.current_version(), newer);
    }
}
