//! Typed collections over the generic record table.

use crate::error::{MetadataError, MetadataResult};
use crate::store::{unix_now, MetadataStore, Transaction};
use crate::watch::{EventKind, RawEvent};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Executor, Sqlite};

/// A record stored in a named collection.
///
/// `key` must be stable for the record's lifetime; `indexes` are recomputed
/// and rewritten in the same transaction as every put.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: &'static str;

    fn key(&self) -> String;

    fn indexes(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }
}

/// Iteration order for `list`, by creation revision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

fn decode<T: Record>(value: &str) -> MetadataResult<T> {
    Ok(serde_json::from_str(value)?)
}

async fn fetch_value<'e, E>(
    executor: E,
    collection: &'static str,
    key: &str,
) -> MetadataResult<Option<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT value FROM records
         WHERE collection = ? AND key = ? AND (expires_at IS NULL OR expires_at > ?)",
    )
    .bind(collection)
    .bind(key)
    .bind(unix_now())
    .fetch_optional(executor)
    .await?;
    Ok(row.map(|(value,)| value))
}

async fn fetch_list<'e, E>(
    executor: E,
    collection: &'static str,
    order: Order,
) -> MetadataResult<Vec<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = match order {
        Order::Asc => {
            "SELECT value FROM records
             WHERE collection = ? AND (expires_at IS NULL OR expires_at > ?)
             ORDER BY created_rev ASC, key ASC"
        }
        Order::Desc => {
            "SELECT value FROM records
             WHERE collection = ? AND (expires_at IS NULL OR expires_at > ?)
             ORDER BY created_rev DESC, key DESC"
        }
    };
    let rows: Vec<(String,)> = sqlx::query_as(sql)
        .bind(collection)
        .bind(unix_now())
        .fetch_all(executor)
        .await?;
    Ok(rows.into_iter().map(|(value,)| value).collect())
}

async fn fetch_by_index<'e, E>(
    executor: E,
    collection: &'static str,
    idx: &str,
    value: &str,
) -> MetadataResult<Vec<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT r.value FROM records r
         JOIN record_indexes i
           ON i.collection = r.collection AND i.key = r.key
         WHERE i.collection = ? AND i.idx = ? AND i.value = ?
           AND (r.expires_at IS NULL OR r.expires_at > ?)
         ORDER BY r.created_rev ASC, r.key ASC",
    )
    .bind(collection)
    .bind(idx)
    .bind(value)
    .bind(unix_now())
    .fetch_all(executor)
    .await?;
    Ok(rows.into_iter().map(|(value,)| value).collect())
}

fn escape_like(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 2);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl Transaction {
    /// Fetch a record by key, observing writes staged in this transaction.
    pub async fn try_get<T: Record>(&mut self, key: &str) -> MetadataResult<Option<T>> {
        match fetch_value(&mut *self.tx, T::COLLECTION, key).await? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Like `try_get` but `NotFound` when absent.
    pub async fn get<T: Record>(&mut self, key: &str) -> MetadataResult<T> {
        self.try_get(key).await?.ok_or_else(|| MetadataError::NotFound {
            collection: T::COLLECTION,
            key: key.to_string(),
        })
    }

    /// Insert a new record; `AlreadyExists` if the key is taken.
    pub async fn insert<T: Record>(&mut self, record: &T) -> MetadataResult<()> {
        let key = record.key();
        if fetch_value(&mut *self.tx, T::COLLECTION, &key).await?.is_some() {
            return Err(MetadataError::AlreadyExists {
                collection: T::COLLECTION,
                key,
            });
        }
        self.upsert(record, None).await
    }

    /// Create or replace a record.
    pub async fn put<T: Record>(&mut self, record: &T) -> MetadataResult<()> {
        self.upsert(record, None).await
    }

    /// Create or replace a record that expires. The TTL is a lower bound:
    /// the record stays visible at least `ttl_secs` past this put.
    pub async fn put_ttl<T: Record>(&mut self, record: &T, ttl_secs: u64) -> MetadataResult<()> {
        self.upsert(record, Some(ttl_secs)).await
    }

    async fn upsert<T: Record>(&mut self, record: &T, ttl_secs: Option<u64>) -> MetadataResult<()> {
        let key = record.key();
        let value = serde_json::to_string(record)?;
        let expires_at = ttl_secs.map(|secs| unix_now() + secs as i64);
        let old = fetch_value(&mut *self.tx, T::COLLECTION, &key).await?;

        if old.as_deref() == Some(value.as_str()) {
            // Byte-identical rewrite: refresh (or clear) the expiry, but
            // never emit a watch event.
            sqlx::query("UPDATE records SET expires_at = ? WHERE collection = ? AND key = ?")
                .bind(expires_at)
                .bind(T::COLLECTION)
                .bind(&key)
                .execute(&mut *self.tx)
                .await?;
            return Ok(());
        }

        let rev = self.write_revision().await?;
        if old.is_some() {
            sqlx::query(
                "UPDATE records SET value = ?, updated_rev = ?, expires_at = ?
                 WHERE collection = ? AND key = ?",
            )
            .bind(&value)
            .bind(rev)
            .bind(expires_at)
            .bind(T::COLLECTION)
            .bind(&key)
            .execute(&mut *self.tx)
            .await?;
            sqlx::query("DELETE FROM record_indexes WHERE collection = ? AND key = ?")
                .bind(T::COLLECTION)
                .bind(&key)
                .execute(&mut *self.tx)
                .await?;
        } else {
            sqlx::query(
                "INSERT OR REPLACE INTO records
                 (collection, key, value, created_rev, updated_rev, expires_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(T::COLLECTION)
            .bind(&key)
            .bind(&value)
            .bind(rev)
            .bind(rev)
            .bind(expires_at)
            .execute(&mut *self.tx)
            .await?;
            // an expired row may still occupy the key
            sqlx::query("DELETE FROM record_indexes WHERE collection = ? AND key = ?")
                .bind(T::COLLECTION)
                .bind(&key)
                .execute(&mut *self.tx)
                .await?;
        }

        for (idx, idx_value) in record.indexes() {
            sqlx::query(
                "INSERT OR REPLACE INTO record_indexes (collection, idx, value, key)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(T::COLLECTION)
            .bind(idx)
            .bind(&idx_value)
            .bind(&key)
            .execute(&mut *self.tx)
            .await?;
        }

        self.events.push((
            T::COLLECTION,
            RawEvent {
                kind: EventKind::Put,
                key,
                value: serde_json::to_value(record)?,
                revision: rev,
            },
        ));
        Ok(())
    }

    /// Delete a record; `NotFound` when absent.
    pub async fn delete<T: Record>(&mut self, key: &str) -> MetadataResult<()> {
        let old = fetch_value(&mut *self.tx, T::COLLECTION, key)
            .await?
            .ok_or_else(|| MetadataError::NotFound {
                collection: T::COLLECTION,
                key: key.to_string(),
            })?;
        let rev = self.write_revision().await?;
        sqlx::query("DELETE FROM records WHERE collection = ? AND key = ?")
            .bind(T::COLLECTION)
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        sqlx::query("DELETE FROM record_indexes WHERE collection = ? AND key = ?")
            .bind(T::COLLECTION)
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        self.events.push((
            T::COLLECTION,
            RawEvent {
                kind: EventKind::Delete,
                key: key.to_string(),
                value: serde_json::from_str(&old)?,
                revision: rev,
            },
        ));
        Ok(())
    }

    /// Delete every record whose key starts with `prefix`. Returns how many
    /// went away; deleting nothing is not an error.
    pub async fn delete_prefix<T: Record>(&mut self, prefix: &str) -> MetadataResult<u64> {
        let pattern = format!("{}%", escape_like(prefix));
        let keys: Vec<(String,)> = sqlx::query_as(
            "SELECT key FROM records
             WHERE collection = ? AND key LIKE ? ESCAPE '\\'",
        )
        .bind(T::COLLECTION)
        .bind(&pattern)
        .fetch_all(&mut *self.tx)
        .await?;
        let mut deleted = 0;
        for (key,) in keys {
            self.delete::<T>(&key).await?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// All live records of the collection ordered by creation revision.
    pub async fn list<T: Record>(&mut self, order: Order) -> MetadataResult<Vec<T>> {
        fetch_list(&mut *self.tx, T::COLLECTION, order)
            .await?
            .iter()
            .map(|value| decode(value))
            .collect()
    }

    /// All records whose `idx` entry equals `value`, in creation order.
    pub async fn get_by_index<T: Record>(
        &mut self,
        idx: &'static str,
        value: &str,
    ) -> MetadataResult<Vec<T>> {
        fetch_by_index(&mut *self.tx, T::COLLECTION, idx, value)
            .await?
            .iter()
            .map(|value| decode(value))
            .collect()
    }

    pub async fn count<T: Record>(&mut self) -> MetadataResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM records
             WHERE collection = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(T::COLLECTION)
        .bind(unix_now())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count as u64)
    }
}

/// One-shot read operations outside any transaction.
impl MetadataStore {
    pub async fn try_get<T: Record>(&self, key: &str) -> MetadataResult<Option<T>> {
        match fetch_value(self.pool(), T::COLLECTION, key).await? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    pub async fn get<T: Record>(&self, key: &str) -> MetadataResult<T> {
        self.try_get(key).await?.ok_or_else(|| MetadataError::NotFound {
            collection: T::COLLECTION,
            key: key.to_string(),
        })
    }

    pub async fn list<T: Record>(&self, order: Order) -> MetadataResult<Vec<T>> {
        fetch_list(self.pool(), T::COLLECTION, order)
            .await?
            .iter()
            .map(|value| decode(value))
            .collect()
    }

    pub async fn get_by_index<T: Record>(
        &self,
        idx: &'static str,
        value: &str,
    ) -> MetadataResult<Vec<T>> {
        fetch_by_index(self.pool(), T::COLLECTION, idx, value)
            .await?
            .iter()
            .map(|value| decode(value))
            .collect()
    }

    pub async fn count<T: Record>(&self) -> MetadataResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM records
             WHERE collection = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(T::COLLECTION)
        .bind(unix_now())
        .fetch_one(self.pool())
        .await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::WatchFilter;
    use serde::Deserialize;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Widget {
        name: String,
        color: String,
        weight: u32,
    }

    impl Record for Widget {
        const COLLECTION: &'static str = "widgets";

        fn key(&self) -> String {
            self.name.clone()
        }

        fn indexes(&self) -> Vec<(&'static str, String)> {
            vec![("color", self.color.clone())]
        }
    }

    fn widget(name: &str, color: &str, weight: u32) -> Widget {
        Widget {
            name: name.to_string(),
            color: color.to_string(),
            weight,
        }
    }

    async fn store() -> MetadataStore {
        MetadataStore::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = store().await;
        let w = widget("a", "red", 1);
        store
            .transact(|tx| {
                let w = w.clone();
                Box::pin(async move { tx.put(&w).await })
            })
            .await
            .unwrap();
        let got: Widget = store.get("a").await.unwrap();
        assert_eq!(got, w);
        assert!(matches!(
            store.get::<Widget>("missing").await,
            Err(MetadataError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let store = store().await;
        let w = widget("a", "red", 1);
        store
            .transact(|tx| {
                let w = w.clone();
                Box::pin(async move { tx.insert(&w).await })
            })
            .await
            .unwrap();
        let err = store
            .transact(|tx| {
                let w = w.clone();
                Box::pin(async move { tx.insert(&w).await })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_list_orders_by_creation() {
        let store = store().await;
        for name in ["first", "second", "third"] {
            store
                .transact(|tx| {
                    let w = widget(name, "blue", 0);
                    Box::pin(async move { tx.put(&w).await })
                })
                .await
                .unwrap();
        }
        // updating "first" must not reorder it
        store
            .transact(|tx| {
                let w = widget("first", "blue", 9);
                Box::pin(async move { tx.put(&w).await })
            })
            .await
            .unwrap();

        let asc: Vec<Widget> = store.list(Order::Asc).await.unwrap();
        let names: Vec<_> = asc.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);

        let desc: Vec<Widget> = store.list(Order::Desc).await.unwrap();
        assert_eq!(desc[0].name, "third");
    }

    #[tokio::test]
    async fn test_secondary_index_follows_updates() {
        let store = store().await;
        store
            .transact(|tx| {
                Box::pin(async move {
                    tx.put(&widget("a", "red", 1)).await?;
                    tx.put(&widget("b", "red", 2)).await?;
                    tx.put(&widget("c", "green", 3)).await
                })
            })
            .await
            .unwrap();

        let reds: Vec<Widget> = store.get_by_index("color", "red").await.unwrap();
        assert_eq!(reds.len(), 2);

        // repaint a; index rows move in the same transaction
        store
            .transact(|tx| {
                Box::pin(async move { tx.put(&widget("a", "green", 1)).await })
            })
            .await
            .unwrap();
        let reds: Vec<Widget> = store.get_by_index("color", "red").await.unwrap();
        assert_eq!(reds.len(), 1);
        let greens: Vec<Widget> = store.get_by_index("color", "green").await.unwrap();
        assert_eq!(greens.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_and_prefix_delete() {
        let store = store().await;
        store
            .transact(|tx| {
                Box::pin(async move {
                    tx.put(&widget("job/1", "red", 1)).await?;
                    tx.put(&widget("job/2", "red", 2)).await?;
                    tx.put(&widget("other", "red", 3)).await
                })
            })
            .await
            .unwrap();

        let deleted = store
            .transact(|tx| Box::pin(async move { tx.delete_prefix::<Widget>("job/").await }))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.count::<Widget>().await.unwrap(), 1);

        let err = store
            .transact(|tx| Box::pin(async move { tx.delete::<Widget>("job/1").await }))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_ttl_expiry_hides_records() {
        let store = store().await;
        store
            .transact(|tx| {
                Box::pin(async move { tx.put_ttl(&widget("gone", "red", 1), 0).await })
            })
            .await
            .unwrap();
        // expires_at == now is already invisible
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(store.try_get::<Widget>("gone").await.unwrap().is_none());
        assert!(store.sweep_expired().await.unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_duplicate_put_suppresses_watch_event() {
        let store = store().await;
        let mut watcher = store.watch::<Widget>(WatchFilter::All);

        let w = widget("a", "red", 1);
        for _ in 0..2 {
            store
                .transact(|tx| {
                    let w = w.clone();
                    Box::pin(async move { tx.put(&w).await })
                })
                .await
                .unwrap();
        }
        let w2 = widget("a", "red", 2);
        store
            .transact(|tx| {
                let w2 = w2.clone();
                Box::pin(async move { tx.put(&w2).await })
            })
            .await
            .unwrap();

        // first put and the real change arrive; the duplicate does not
        let first = watcher.next().await.unwrap();
        assert_eq!(first.record.weight, 1);
        let second = watcher.next().await.unwrap();
        assert_eq!(second.record.weight, 2);
        assert!(second.revision > first.revision);
    }

    #[tokio::test]
    async fn test_watch_by_index_filter() {
        let store = store().await;
        let mut watcher = store.watch::<Widget>(WatchFilter::Index("color", "green".to_string()));
        store
            .transact(|tx| {
                Box::pin(async move {
                    tx.put(&widget("a", "red", 1)).await?;
                    tx.put(&widget("b", "green", 2)).await
                })
            })
            .await
            .unwrap();
        let event = watcher.next().await.unwrap();
        assert_eq!(event.record.name, "b");
    }

    #[tokio::test]
    async fn test_dryrun_discards_writes() {
        let store = store().await;
        store
            .dryrun_transact(|tx| {
                Box::pin(async move {
                    tx.put(&widget("ghost", "red", 1)).await?;
                    // the write is visible inside the transaction
                    let seen: Option<Widget> = tx.try_get("ghost").await?;
                    assert!(seen.is_some());
                    Ok::<_, MetadataError>(())
                })
            })
            .await
            .unwrap();
        assert!(store.try_get::<Widget>("ghost").await.unwrap().is_none());
    }
}
