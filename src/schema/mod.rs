//! TTL-cached snapshot of backend table schemas.
//!
//! Process-global, consulted by the rewriter for type-dependent decisions
//! (conflict targets, identity columns) and by COM_FIELD_LIST. Fills are
//! singleflight per key: the entry's async mutex admits one filler while
//! other lookups for the same table wait on the result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::config::get_config;
use crate::errors::Error;
use crate::pool::{try_get_pool, AcquireReason};

pub static CACHE: Lazy<SchemaCache> = Lazy::new(SchemaCache::new);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub type_oid: u32,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnSchema>,
    pub primary_key: Vec<String>,
    pub identity: Option<String>,
}

struct CachedEntry {
    schema: Arc<TableSchema>,
    filled_at: Instant,
}

struct Slot {
    fill: tokio::sync::Mutex<Option<CachedEntry>>,
}

type Key = (String, String);

pub struct SchemaCache {
    entries: Mutex<HashMap<Key, Arc<Slot>>>,
}

impl SchemaCache {
    pub fn new() -> SchemaCache {
        SchemaCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a table's schema, filling from the backend on miss or expiry.
    /// Returns `Ok(None)` when the cache is disabled or the table does not
    /// exist.
    pub async fn lookup(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Option<Arc<TableSchema>>, Error> {
        let config = get_config();
        if !config.schema_cache.enabled {
            return Ok(None);
        }
        let ttl = Duration::from_millis(config.schema_cache.ttl);
        let max_entries = config.schema_cache.max_entries;

        let key = (database.to_string(), table.to_string());
        let slot = {
            let mut entries = self.entries.lock();
            if entries.len() >= max_entries && !entries.contains_key(&key) {
                // Cheap pressure valve: drop everything stale, then one
                // arbitrary entry if the map is still full.
                entries.retain(|_, slot| {
                    slot.fill
                        .try_lock()
                        .map(|guard| {
                            guard
                                .as_ref()
                                .is_some_and(|entry| entry.filled_at.elapsed() < ttl)
                        })
                        .unwrap_or(true)
                });
                if entries.len() >= max_entries {
                    if let Some(victim) = entries.keys().next().cloned() {
                        entries.remove(&victim);
                    }
                }
            }
            entries
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(Slot {
                        fill: tokio::sync::Mutex::new(None),
                    })
                })
                .clone()
        };

        let mut guard = slot.fill.lock().await;
        if let Some(entry) = guard.as_ref() {
            if entry.filled_at.elapsed() < ttl {
                return Ok(Some(entry.schema.clone()));
            }
        }

        debug!("schema cache fill for {database:?}.{table:?}");
        match fetch_schema(database, table).await? {
            Some(schema) => {
                let schema = Arc::new(schema);
                *guard = Some(CachedEntry {
                    schema: schema.clone(),
                    filled_at: Instant::now(),
                });
                Ok(Some(schema))
            }
            None => {
                *guard = None;
                Ok(None)
            }
        }
    }

    /// Drop cached entries for a table; the handler calls this when it
    /// observes DDL against it.
    pub fn invalidate(&self, table: &str) {
        self.entries.lock().retain(|(_, t), _| t != table);
    }

    /// Seed an entry directly, bypassing the backend fill.
    #[cfg(test)]
    pub fn prime(&self, database: &str, table: &str, schema: TableSchema) {
        let slot = Arc::new(Slot {
            fill: tokio::sync::Mutex::new(Some(CachedEntry {
                schema: Arc::new(schema),
                filled_at: Instant::now(),
            })),
        });
        self.entries
            .lock()
            .insert((database.to_string(), table.to_string()), slot);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}

/// One catalog query covering columns, nullability, identity and the
/// primary key. An empty database name means the connection's search path.
///
/// A saturated (or absent) pool degrades to a miss rather than failing the
/// statement that asked: the callers treat `None` as "schema unknown".
async fn fetch_schema(database: &str, table: &str) -> Result<Option<TableSchema>, Error> {
    let pool = match try_get_pool() {
        Some(pool) => pool,
        None => return Ok(None),
    };
    let conn = match pool.acquire(0, AcquireReason::SchemaFill).await {
        Ok(conn) => conn,
        Err(Error::PoolExhausted { waited_ms }) => {
            log::warn!("schema fill skipped: pool exhausted after {waited_ms}ms");
            return Ok(None);
        }
        Err(err) => return Err(err),
    };

    let sql = "SELECT a.attname::text AS name, \
                      a.atttypid::int4 AS oid, \
                      NOT a.attnotnull AS nullable, \
                      a.attidentity <> '' AS is_identity, \
                      COALESCE(i.indisprimary, false) AS is_pk \
               FROM pg_catalog.pg_attribute a \
               JOIN pg_catalog.pg_class c ON c.oid = a.attrelid \
               JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
               LEFT JOIN pg_catalog.pg_index i \
                 ON i.indrelid = c.oid AND i.indisprimary AND a.attnum = ANY(i.indkey) \
               WHERE c.relname = $1 \
                 AND n.nspname = COALESCE(NULLIF($2, ''), current_schema()) \
                 AND a.attnum > 0 AND NOT a.attisdropped \
               ORDER BY a.attnum";

    let rows = conn.client().query(sql, &[&table, &database]).await?;
    if rows.is_empty() {
        return Ok(None);
    }

    let mut schema = TableSchema {
        table: table.to_string(),
        columns: Vec::with_capacity(rows.len()),
        primary_key: Vec::new(),
        identity: None,
    };
    for row in rows {
        let name: String = row.try_get("name")?;
        let oid: i32 = row.try_get("oid")?;
        let nullable: bool = row.try_get("nullable")?;
        let is_identity: bool = row.try_get("is_identity")?;
        let is_pk: bool = row.try_get("is_pk")?;
        if is_pk {
            schema.primary_key.push(name.clone());
        }
        if is_identity && schema.identity.is_none() {
            schema.identity = Some(name.clone());
        }
        schema.columns.push(ColumnSchema {
            name,
            type_oid: oid as u32,
            nullable,
        });
    }
    Ok(Some(schema))
}
