use crate::events::JsonMap;
use crate::storage::{Storage, StorageKey};

/// Identity applied to every outgoing event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserInfo {
    pub anonymous_id: String,
    pub user_id: Option<String>,
    pub traits: Option<JsonMap>,
}

impl UserInfo {
    /// Unidentified user with a freshly minted anonymous id.
    pub fn fresh() -> Self {
        Self {
            anonymous_id: uuid::Uuid::new_v4().to_string(),
            user_id: None,
            traits: None,
        }
    }

    /// Identity persisted by a previous run. A missing anonymous id is minted;
    /// unreadable traits are discarded.
    pub fn load(storage: &dyn Storage) -> Self {
        let anonymous_id = storage
            .read(StorageKey::AnonymousId)
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let user_id = storage
            .read(StorageKey::UserId)
            .filter(|id| !id.trim().is_empty());

        let traits = storage.read(StorageKey::Traits).and_then(|raw| {
            match serde_json::from_str::<JsonMap>(&raw) {
                Ok(traits) => Some(traits),
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding unreadable stored traits");
                    None
                }
            }
        });

        Self {
            anonymous_id,
            user_id,
            traits,
        }
    }

    /// Write every field through, removing the ones that are unset.
    pub fn save(&self, storage: &dyn Storage) {
        if let Err(e) = storage.write(StorageKey::AnonymousId, &self.anonymous_id) {
            tracing::warn!(error = %e, "Failed to persist anonymous id");
        }

        match &self.user_id {
            Some(user_id) => {
                if let Err(e) = storage.write(StorageKey::UserId, user_id) {
                    tracing::warn!(error = %e, "Failed to persist user id");
                }
            }
            None => {
                storage.remove(StorageKey::UserId);
            }
        }

        match self.traits.as_ref().map(serde_json::to_string) {
            Some(Ok(raw)) => {
                if let Err(e) = storage.write(StorageKey::Traits, &raw) {
                    tracing::warn!(error = %e, "Failed to persist traits");
                }
            }
            Some(Err(e)) => tracing::warn!(error = %e, "Failed to serialize traits"),
            None => {
                storage.remove(StorageKey::Traits);
            }
        }
    }

    /// Merge `traits` over the current ones.
    pub fn merge_traits(&mut self, traits: &JsonMap) {
        let current = self.traits.get_or_insert_with(JsonMap::new);
        for (key, value) in traits {
            current.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageProvider;
    use serde_json::json;

    #[test]
    fn test_load_mints_anonymous_id_once() {
        let storage = StorageProvider::InMemory.create("wk").unwrap();
        let first = UserInfo::load(storage.as_ref());
        assert!(!first.anonymous_id.is_empty());
        first.save(storage.as_ref());

        let second = UserInfo::load(storage.as_ref());
        assert_eq!(first.anonymous_id, second.anonymous_id);
        assert!(second.user_id.is_none());
    }

    #[test]
    fn test_save_and_clear() {
        let storage = StorageProvider::InMemory.create("wk").unwrap();
        let mut info = UserInfo::fresh();
        info.user_id = Some("u-1".to_string());
        info.merge_traits(json!({"plan": "pro"}).as_object().unwrap());
        info.save(storage.as_ref());

        let loaded = UserInfo::load(storage.as_ref());
        assert_eq!(loaded, info);

        UserInfo::fresh().save(storage.as_ref());
        assert!(storage.read(StorageKey::UserId).is_none());
        assert!(storage.read(StorageKey::Traits).is_none());
    }

    #[test]
    fn test_corrupt_traits_discarded() {
        let storage = StorageProvider::InMemory.create("wk").unwrap();
        storage.write(StorageKey::Traits, "{not json").unwrap();
        assert!(UserInfo::load(storage.as_ref()).traits.is_none());
    }

    #[test]
    fn test_merge_traits_overwrites_keys() {
        let mut info = UserInfo::fresh();
        info.merge_traits(json!({"a": 1, "b": 1}).as_object().unwrap());
        info.merge_traits(json!({"b": 2}).as_object().unwrap());
        let traits = info.traits.unwrap();
        assert_eq!(traits["a"], 1);
        assert_eq!(traits["b"], 2);
    }
}
