//! Registry of hosted objects.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::adapter::ObjectAdapter;
use crate::error::{Error, Result};
use crate::serializer::ObjectRef;

const REMOVALS_CAPACITY: usize = 256;

struct RepositoryInner {
    objects: RwLock<HashMap<String, Arc<ObjectAdapter>>>,
    removals: broadcast::Sender<String>,
}

/// Hosted objects by id, with reverse lookup by instance identity.
///
/// Cloning shares the same registry.
#[derive(Clone)]
pub struct ObjectsRepository {
    inner: Arc<RepositoryInner>,
}

impl Default for ObjectsRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectsRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        let (removals, _) = broadcast::channel(REMOVALS_CAPACITY);
        Self {
            inner: Arc::new(RepositoryInner {
                objects: RwLock::new(HashMap::new()),
                removals,
            }),
        }
    }

    /// Register `adapter` under its object id.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ObjectAlreadyHosted`] if the id is taken.
    pub fn add(&self, adapter: ObjectAdapter) -> Result<Registration> {
        let object_id = adapter.object_id().to_string();
        let adapter = Arc::new(adapter);

        {
            let mut objects = self.inner.objects.write();
            if objects.contains_key(&object_id) {
                return Err(Error::ObjectAlreadyHosted(object_id));
            }
            objects.insert(object_id.clone(), adapter.clone());
        }

        debug!("Hosted object {}", object_id);
        Ok(Registration {
            repository: Arc::downgrade(&self.inner),
            adapter: Arc::downgrade(&adapter),
            object_id,
            active: true,
        })
    }

    /// The adapter hosted under `object_id`.
    #[must_use]
    pub fn try_get_object(&self, object_id: &str) -> Option<Arc<ObjectAdapter>> {
        self.inner.objects.read().get(object_id).cloned()
    }

    /// Whether something is hosted under `object_id`.
    #[must_use]
    pub fn contains(&self, object_id: &str) -> bool {
        self.inner.objects.read().contains_key(object_id)
    }

    /// The id `instance` is hosted under, compared by identity.
    #[must_use]
    pub fn try_get_object_id<U: ?Sized>(&self, instance: &Arc<U>) -> Option<String> {
        let identity = Arc::as_ptr(instance).cast::<()>() as usize;
        self.inner
            .objects
            .read()
            .iter()
            .find(|(_, adapter)| adapter.identity() == identity)
            .map(|(id, _)| id.clone())
    }

    /// The hosted instance behind `reference`, if it exists and is a `U`.
    #[must_use]
    pub fn resolve<U: Send + Sync + 'static>(&self, reference: &ObjectRef) -> Option<Arc<U>> {
        self.try_get_object(&reference.object_id)?
            .instance()
            .downcast::<U>()
            .ok()
    }

    /// Unhost `object_id`. Returns whether it was hosted.
    pub fn remove(&self, object_id: &str) -> bool {
        let removed = self.inner.objects.write().remove(object_id);
        if let Some(adapter) = removed {
            self.inner.announce_removal(object_id);
            drop(adapter);
            true
        } else {
            false
        }
    }

    /// Receive the id of every object removed from now on.
    #[must_use]
    pub fn removals(&self) -> broadcast::Receiver<String> {
        self.inner.removals.subscribe()
    }

    /// Ids of all hosted objects.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.inner.objects.read().keys().cloned().collect()
    }

    /// Number of hosted objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.objects.read().len()
    }

    /// Whether nothing is hosted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.objects.read().is_empty()
    }

    /// Unhost everything.
    pub(crate) fn clear(&self) {
        let drained: Vec<(String, Arc<ObjectAdapter>)> =
            self.inner.objects.write().drain().collect();
        for (object_id, _) in &drained {
            self.inner.announce_removal(object_id);
        }
    }
}

impl RepositoryInner {
    fn announce_removal(&self, object_id: &str) {
        debug!("Unhosted object {}", object_id);
        // No receivers is fine
        let _ = self.removals.send(object_id.to_string());
    }
}

/// Disposal token returned when an object is hosted.
///
/// Dropping or disposing it unhosts the object.
#[must_use = "dropping the registration unhosts the object"]
pub struct Registration {
    repository: Weak<RepositoryInner>,
    adapter: Weak<ObjectAdapter>,
    object_id: String,
    active: bool,
}

impl Registration {
    /// Id the object is hosted under.
    #[must_use]
    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    /// Unhost the object now.
    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        let Some(repository) = self.repository.upgrade() else {
            return;
        };

        let removed = {
            let mut objects = repository.objects.write();
            // The id may have been re-hosted after an explicit remove
            let ours = objects
                .get(&self.object_id)
                .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), self.adapter.as_ptr()));
            if ours {
                objects.remove(&self.object_id)
            } else {
                None
            }
        };

        if let Some(adapter) = removed {
            repository.announce_removal(&self.object_id);
            drop(adapter);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("object_id", &self.object_id)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosted::HostedContract;

    struct Thing {
        label: &'static str,
    }

    fn adapter(id: &str, instance: Arc<Thing>) -> ObjectAdapter {
        let contract = HostedContract::<Thing>::builder("Thing")
            .property_get("Label", |thing: &Thing| Ok(thing.label))
            .build()
            .unwrap();
        ObjectAdapter::new(id, instance, contract, None)
    }

    #[test]
    fn test_add_and_lookup() {
        let repository = ObjectsRepository::new();
        let instance = Arc::new(Thing { label: "a" });
        let _registration = repository.add(adapter("a", instance.clone())).unwrap();

        assert!(repository.try_get_object("a").is_some());
        assert!(repository.try_get_object("b").is_none());
        assert_eq!(repository.try_get_object_id(&instance).as_deref(), Some("a"));
        assert_eq!(
            repository.try_get_object_id(&Arc::new(Thing { label: "a" })),
            None
        );
        assert_eq!(repository.len(), 1);
    }

    #[test]
    fn test_duplicate_id() {
        let repository = ObjectsRepository::new();
        let _first = repository
            .add(adapter("dup", Arc::new(Thing { label: "1" })))
            .unwrap();
        assert!(matches!(
            repository.add(adapter("dup", Arc::new(Thing { label: "2" }))),
            Err(Error::ObjectAlreadyHosted(id)) if id == "dup"
        ));
    }

    #[test]
    fn test_registration_drop_unhosts() {
        let repository = ObjectsRepository::new();
        let mut removals = repository.removals();

        let registration = repository
            .add(adapter("gone", Arc::new(Thing { label: "g" })))
            .unwrap();
        assert_eq!(registration.object_id(), "gone");
        drop(registration);

        assert!(repository.is_empty());
        assert_eq!(removals.try_recv().unwrap(), "gone");
    }

    #[test]
    fn test_stale_registration_leaves_new_object() {
        let repository = ObjectsRepository::new();
        let old = repository
            .add(adapter("slot", Arc::new(Thing { label: "old" })))
            .unwrap();
        assert!(repository.remove("slot"));

        let replacement = Arc::new(Thing { label: "new" });
        let _new = repository.add(adapter("slot", replacement.clone())).unwrap();
        old.dispose();

        assert_eq!(
            repository.try_get_object_id(&replacement).as_deref(),
            Some("slot")
        );
    }

    #[test]
    fn test_resolve_downcasts() {
        let repository = ObjectsRepository::new();
        let instance = Arc::new(Thing { label: "r" });
        let _registration = repository.add(adapter("r", instance.clone())).unwrap();

        let resolved: Arc<Thing> = repository.resolve(&ObjectRef::new("r")).unwrap();
        assert!(Arc::ptr_eq(&resolved, &instance));
        assert!(repository.resolve::<String>(&ObjectRef::new("r")).is_none());
        assert!(repository.resolve::<Thing>(&ObjectRef::new("missing")).is_none());
    }
}
