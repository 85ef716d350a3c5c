//! TTL leases: the store's distributed-lock primitive.
//!
//! A lease is a record with a TTL. Acquisition inserts it; an expired lease
//! is invisible to reads, so acquisition after expiry succeeds naturally.
//! Holders renew by re-putting with a fresh TTL.

use crate::collection::Record;
use crate::error::MetadataResult;
use crate::store::MetadataStore;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A held lease.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub name: String,
    pub holder: String,
}

impl Record for LeaseRecord {
    const COLLECTION: &'static str = "leases";

    fn key(&self) -> String {
        self.name.clone()
    }
}

/// Try to acquire (or renew) the named lease for `holder`. Returns whether
/// the caller now holds it.
pub async fn acquire(
    store: &MetadataStore,
    name: &str,
    holder: &str,
    ttl: Duration,
) -> MetadataResult<bool> {
    let lease = LeaseRecord {
        name: name.to_string(),
        holder: holder.to_string(),
    };
    store
        .transact(move |tx| {
            let lease = lease.clone();
            Box::pin(async move {
                match tx.try_get::<LeaseRecord>(&lease.name).await? {
                    Some(current) if current.holder != lease.holder => Ok(false),
                    _ => {
                        tx.put_ttl(&lease, ttl.as_secs()).await?;
                        Ok(true)
                    }
                }
            })
        })
        .await
}

/// Release the named lease if `holder` still owns it.
pub async fn release(store: &MetadataStore, name: &str, holder: &str) -> MetadataResult<bool> {
    let name = name.to_string();
    let holder = holder.to_string();
    store
        .transact(move |tx| {
            let name = name.clone();
            let holder = holder.clone();
            Box::pin(async move {
                match tx.try_get::<LeaseRecord>(&name).await? {
                    Some(current) if current.holder == holder => {
                        tx.delete::<LeaseRecord>(&name).await?;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            })
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_renew_release() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        assert!(acquire(&store, "pipeline/edges", "a", Duration::from_secs(30))
            .await
            .unwrap());
        // renewal by the holder succeeds, takeover fails
        assert!(acquire(&store, "pipeline/edges", "a", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(!acquire(&store, "pipeline/edges", "b", Duration::from_secs(30))
            .await
            .unwrap());

        assert!(!release(&store, "pipeline/edges", "b").await.unwrap());
        assert!(release(&store, "pipeline/edges", "a").await.unwrap());
        assert!(acquire(&store, "pipeline/edges", "b", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_up_for_grabs() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        assert!(acquire(&store, "l", "a", Duration::from_secs(0)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(acquire(&store, "l", "b", Duration::from_secs(30)).await.unwrap());
    }
}
