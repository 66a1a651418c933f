use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::store::{Store, StoreError};

/// A document persisted in the configuration directory
pub trait StoredConfig
where
    Self: Serialize,
    Self: DeserializeOwned,
{
    fn kind() -> &'static str;

    /// This config's preferred file name excluding the extension.
    fn default_name() -> &'static str {
        Self::kind()
    }
}

/// Load a config from `store`, if one was stored before
pub async fn load<C: StoredConfig>(store: &Store) -> Result<Option<C>, StoreError> {
    debug!("reading {} config", C::kind());
    store.read("/", C::default_name()).await
}

/// Persist a config to `store` under its default name
pub async fn save<C: StoredConfig>(store: &Store, config: &C) -> Result<(), StoreError> {
    debug!("storing {} config", C::kind());
    store.write("/", C::default_name(), config).await
}

/// Remove a previously stored config
pub async fn remove<C: StoredConfig>(store: &Store) -> Result<(), StoreError> {
    debug!("removing {} config", C::kind());
    store.delete("/", C::default_name()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Identity {
        device_id: String,
    }

    impl StoredConfig for Identity {
        fn kind() -> &'static str {
            "identity"
        }
    }

    #[tokio::test]
    async fn test_stored_config_lifecycle() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());

        assert_eq!(load::<Identity>(&store).await.unwrap(), None);

        let identity = Identity {
            device_id: "dev-7".into(),
        };
        save(&store, &identity).await.unwrap();
        assert!(dir.path().join("identity.json").exists());
        assert_eq!(load::<Identity>(&store).await.unwrap(), Some(identity));

        remove::<Identity>(&store).await.unwrap();
        assert_eq!(load::<Identity>(&store).await.unwrap(), None);
    }
}
