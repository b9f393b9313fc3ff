//! Remote descriptors: transferable, token-carrying object references.

use std::fmt;
use std::sync::Arc;

use crate::core::{InstanceId, ObjectId};

use super::wire::HandleParts;

/// Routes the decrement a handle emits when released.
///
/// Implemented by the manager: a local release posts to the decrement
/// channel, a remote release enqueues an active message. Neither path
/// takes a lock on the caller's thread.
pub(crate) trait HandleReleaser: Send + Sync {
    fn route_release(&self, instance: InstanceId, object: ObjectId, tokens: u64);
}

/// A reference to a stored encoded object, carrying `tokens_held` units
/// of outstanding ownership.
///
/// Dropping the handle emits a decrement of exactly `tokens_held` to the
/// owning instance; the release becomes visible to the producer once the
/// active message is processed.
pub struct RemoteDescriptor {
    instance: InstanceId,
    object: ObjectId,
    tokens: u64,
    releaser: Option<Arc<dyn HandleReleaser>>,
}

impl RemoteDescriptor {
    pub(crate) fn new(
        instance: InstanceId,
        object: ObjectId,
        tokens: u64,
        releaser: Arc<dyn HandleReleaser>,
    ) -> Self {
        Self {
            instance,
            object,
            tokens,
            releaser: Some(releaser),
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn object(&self) -> ObjectId {
        self.object
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub(crate) fn parts(&self) -> HandleParts {
        HandleParts {
            instance: self.instance,
            object: self.object,
            tokens: self.tokens,
        }
    }

    /// Carve `tokens` off into a new handle, e.g. to fan a published
    /// object out to several peers. Returns `None` if that would leave
    /// this handle without a token.
    pub fn split(&mut self, tokens: u64) -> Option<RemoteDescriptor> {
        if tokens == 0 || tokens >= self.tokens {
            return None;
        }
        self.tokens -= tokens;
        Some(RemoteDescriptor {
            instance: self.instance,
            object: self.object,
            tokens,
            releaser: self.releaser.clone(),
        })
    }

    /// Release the handle now, emitting its decrement.
    pub fn release(mut self) {
        self.route();
    }

    /// Disarm the handle: its tokens have been transferred elsewhere
    /// (e.g. onto the wire) and must not be decremented on drop.
    pub(crate) fn forget(mut self) {
        self.tokens = 0;
        self.releaser = None;
    }

    fn route(&mut self) {
        let tokens = std::mem::take(&mut self.tokens);
        if tokens == 0 {
            return;
        }
        if let Some(releaser) = self.releaser.take() {
            releaser.route_release(self.instance, self.object, tokens);
        }
    }
}

impl Drop for RemoteDescriptor {
    fn drop(&mut self) {
        self.route();
    }
}

impl fmt::Debug for RemoteDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteDescriptor")
            .field("instance", &self.instance)
            .field("object", &self.object)
            .field("tokens", &self.tokens)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingReleaser {
        released: Mutex<Vec<(InstanceId, ObjectId, u64)>>,
    }

    impl HandleReleaser for RecordingReleaser {
        fn route_release(&self, instance: InstanceId, object: ObjectId, tokens: u64) {
            self.released
                .lock()
                .unwrap()
                .push((instance, object, tokens));
        }
    }

    fn handle(releaser: &Arc<RecordingReleaser>, tokens: u64) -> RemoteDescriptor {
        RemoteDescriptor::new(
            InstanceId::new(1),
            ObjectId::new(9),
            tokens,
            Arc::clone(releaser) as Arc<dyn HandleReleaser>,
        )
    }

    #[test]
    fn drop_releases_exact_token_count() {
        let releaser = Arc::new(RecordingReleaser::default());
        drop(handle(&releaser, 3));
        assert_eq!(
            releaser.released.lock().unwrap().as_slice(),
            &[(InstanceId::new(1), ObjectId::new(9), 3)]
        );
    }

    #[test]
    fn split_distributes_tokens_without_double_release() {
        let releaser = Arc::new(RecordingReleaser::default());
        let mut original = handle(&releaser, 3);
        let first = original.split(1).unwrap();
        let second = original.split(1).unwrap();
        assert!(original.split(1).is_none(), "last token cannot be split away");

        drop(first);
        drop(second);
        drop(original);

        let released = releaser.released.lock().unwrap();
        let total: u64 = released.iter().map(|(_, _, tokens)| tokens).sum();
        assert_eq!(total, 3);
        assert_eq!(released.len(), 3);
    }

    #[test]
    fn forget_suppresses_the_drop_decrement() {
        let releaser = Arc::new(RecordingReleaser::default());
        handle(&releaser, 2).forget();
        assert!(releaser.released.lock().unwrap().is_empty());
    }
}
