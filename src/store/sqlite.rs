use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::{
    CrawlStore, OrgStore, StoreError, apply_add_collection, apply_crawl_update, apply_presigned,
    crawl_not_found, org_not_found,
};
use crate::Result;
use crate::ledger::monthly_credit;
use crate::quota::reconcile_quota_update;
use crate::types::{
    BaseCrawl, CrawlState, CrawlType, CrawlUpdate, OrgQuotas, OrgQuotasPatch, Organization,
    QuotaUpdateRecord, RolloverPool, StorageKind, StorageRef, TimeCounter,
};

/// SQLite-backed org and crawl store.
///
/// Each call opens its own connection on the blocking pool. Counter updates
/// run inside `BEGIN IMMEDIATE` transactions so concurrent writers, including
/// other processes sharing the file, serialize on the write lock.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn init(&self) -> Result<()> {
        self.run(|_| Ok(())).await
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            op(&mut conn)
        })
        .await?
    }
}

#[async_trait]
impl OrgStore for SqliteStore {
    async fn insert_org(&self, org: &Organization) -> Result<()> {
        let org = org.clone();
        let users_json = serde_json::to_string(&org.users)?;
        let quotas_json = serde_json::to_string(&org.quotas)?;
        let updates = org
            .quota_updates
            .iter()
            .map(|record| -> Result<(String, String)> {
                Ok((
                    format_ts(record.modified)?,
                    serde_json::to_string(&record.update)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT OR REPLACE INTO orgs (
                    id, name, users_json, quotas_json,
                    bytes_stored, bytes_stored_crawls, bytes_stored_uploads, bytes_stored_profiles,
                    gifted_exec_seconds_available, extra_exec_seconds_available
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    org.id,
                    org.name,
                    users_json,
                    quotas_json,
                    u64_to_i64(org.bytes_stored),
                    u64_to_i64(org.bytes_stored_crawls),
                    u64_to_i64(org.bytes_stored_uploads),
                    u64_to_i64(org.bytes_stored_profiles),
                    u64_to_i64(org.gifted_exec_seconds_available),
                    u64_to_i64(org.extra_exec_seconds_available),
                ],
            )?;
            tx.execute(
                "DELETE FROM org_time_counters WHERE org_id = ?1",
                rusqlite::params![org.id],
            )?;
            tx.execute(
                "DELETE FROM org_quota_updates WHERE org_id = ?1",
                rusqlite::params![org.id],
            )?;
            for counter in TimeCounter::ALL {
                for (period, seconds) in org.time_counter(counter) {
                    tx.execute(
                        "INSERT INTO org_time_counters (org_id, counter, period, seconds)
                         VALUES (?1, ?2, ?3, ?4)",
                        rusqlite::params![org.id, counter.as_str(), period, u64_to_i64(*seconds)],
                    )?;
                }
            }
            for (modified, update_json) in updates {
                tx.execute(
                    "INSERT INTO org_quota_updates (org_id, modified, update_json)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![org.id, modified, update_json],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_org(&self, oid: &str) -> Result<Organization> {
        let oid = oid.to_string();
        self.run(move |conn| load_org(conn, &oid)).await
    }

    async fn inc_time_counter(
        &self,
        oid: &str,
        counter: TimeCounter,
        period: &str,
        seconds: u64,
    ) -> Result<()> {
        let oid = oid.to_string();
        let period = period.to_string();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_org(&tx, &oid)?;
            add_counter_seconds(&tx, &oid, counter, &period, seconds)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn credit_monthly_exec(
        &self,
        oid: &str,
        period: &str,
        seconds: u64,
        quota_seconds: u64,
    ) -> Result<u64> {
        let oid = oid.to_string();
        let period = period.to_string();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_org(&tx, &oid)?;
            let used = counter_seconds(&tx, &oid, TimeCounter::Monthly, &period)?;
            let credit = monthly_credit(used, seconds, quota_seconds);
            if credit > 0 {
                add_counter_seconds(&tx, &oid, TimeCounter::Monthly, &period, credit)?;
            }
            tx.commit()?;
            Ok(credit)
        })
        .await
    }

    async fn consume_rollover(
        &self,
        oid: &str,
        pool: RolloverPool,
        period: &str,
        seconds: u64,
    ) -> Result<u64> {
        let oid = oid.to_string();
        let period = period.to_string();
        let column = pool_column(pool);
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let available: Option<i64> = tx
                .query_row(
                    &format!("SELECT {column} FROM orgs WHERE id = ?1"),
                    rusqlite::params![oid],
                    |row| row.get(0),
                )
                .optional()?;
            let available = i64_to_u64(available.ok_or_else(org_not_found)?);
            let consumed = seconds.min(available);
            if consumed > 0 {
                tx.execute(
                    &format!("UPDATE orgs SET {column} = {column} - ?2 WHERE id = ?1"),
                    rusqlite::params![oid, u64_to_i64(consumed)],
                )?;
                add_counter_seconds(&tx, &oid, pool.counter(), &period, consumed)?;
            }
            tx.commit()?;
            Ok(consumed)
        })
        .await
    }

    async fn inc_bytes_stored(&self, oid: &str, delta: i64, kind: StorageKind) -> Result<()> {
        let oid = oid.to_string();
        let sub = bytes_column(kind);
        self.run(move |conn| {
            let changed = conn.execute(
                &format!(
                    "UPDATE orgs
                     SET bytes_stored = MAX(0, bytes_stored + ?2),
                         {sub} = MAX(0, {sub} + ?2)
                     WHERE id = ?1"
                ),
                rusqlite::params![oid, delta],
            )?;
            if changed == 0 {
                return Err(org_not_found());
            }
            Ok(())
        })
        .await
    }

    async fn apply_quota_update(
        &self,
        oid: &str,
        patch: &OrgQuotasPatch,
        modified: OffsetDateTime,
        retention: Option<usize>,
    ) -> Result<Organization> {
        let oid = oid.to_string();
        let patch = patch.clone();
        let modified_raw = format_ts(modified)?;
        let update_json = serde_json::to_string(&patch)?;
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut org = load_org(&tx, &oid)?;
            reconcile_quota_update(&mut org, &patch, modified, retention);

            tx.execute(
                "UPDATE orgs
                 SET quotas_json = ?2,
                     gifted_exec_seconds_available = ?3,
                     extra_exec_seconds_available = ?4
                 WHERE id = ?1",
                rusqlite::params![
                    oid,
                    serde_json::to_string(&org.quotas)?,
                    u64_to_i64(org.gifted_exec_seconds_available),
                    u64_to_i64(org.extra_exec_seconds_available),
                ],
            )?;
            tx.execute(
                "INSERT INTO org_quota_updates (org_id, modified, update_json)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![oid, modified_raw, update_json],
            )?;
            if let Some(keep) = retention {
                tx.execute(
                    "DELETE FROM org_quota_updates
                     WHERE org_id = ?1
                       AND id NOT IN (
                           SELECT id FROM org_quota_updates
                           WHERE org_id = ?1
                           ORDER BY id DESC
                           LIMIT ?2
                       )",
                    rusqlite::params![oid, u64_to_i64(keep.max(1) as u64)],
                )?;
            }
            tx.commit()?;
            Ok(org)
        })
        .await
    }
}

#[async_trait]
impl CrawlStore for SqliteStore {
    async fn insert_crawl(&self, crawl: &BaseCrawl) -> Result<()> {
        let id = crawl.id.clone();
        let oid = crawl.oid.clone();
        let crawl_type = crawl.crawl_type.as_str();
        let value_json = serde_json::to_string(crawl)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO crawls (id, org_id, crawl_type, value_json)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id, oid, crawl_type, value_json],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_crawl(&self, oid: &str, crawl_id: &str) -> Result<BaseCrawl> {
        let oid = oid.to_string();
        let crawl_id = crawl_id.to_string();
        self.run(move |conn| load_crawl(conn, Some(&oid), &crawl_id)?.ok_or_else(crawl_not_found))
            .await
    }

    async fn set_file_presigned(
        &self,
        crawl_id: &str,
        filename: &str,
        url: &str,
        expire_at: OffsetDateTime,
    ) -> Result<bool> {
        let crawl_id = crawl_id.to_string();
        let filename = filename.to_string();
        let url = url.to_string();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut crawl) = load_crawl(&tx, None, &crawl_id)? else {
                return Ok(false);
            };
            let applied = apply_presigned(&mut crawl, &filename, &url, expire_at);
            if applied {
                store_crawl(&tx, &crawl)?;
            }
            tx.commit()?;
            Ok(applied)
        })
        .await
    }

    async fn add_file_replica(
        &self,
        crawl_id: &str,
        filename: &str,
        replica: &StorageRef,
    ) -> Result<()> {
        let crawl_id = crawl_id.to_string();
        let filename = filename.to_string();
        let replica = replica.clone();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut crawl = load_crawl(&tx, None, &crawl_id)?.ok_or_else(crawl_not_found)?;
            let inserted = crawl
                .file_mut(&filename)
                .is_some_and(|file| file.replicas.insert(replica));
            if inserted {
                store_crawl(&tx, &crawl)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn update_crawl_metadata(
        &self,
        oid: &str,
        crawl_id: &str,
        crawl_type: Option<CrawlType>,
        update: &CrawlUpdate,
    ) -> Result<()> {
        let oid = oid.to_string();
        let crawl_id = crawl_id.to_string();
        let update = update.clone();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut crawl = load_crawl(&tx, Some(&oid), &crawl_id)?.ok_or_else(crawl_not_found)?;
            if crawl_type.is_some_and(|wanted| wanted != crawl.crawl_type) {
                return Err(crawl_not_found());
            }
            apply_crawl_update(&mut crawl, &update);
            store_crawl(&tx, &crawl)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn mark_canceled(&self, crawl_id: &str, finished: OffsetDateTime) -> Result<()> {
        let crawl_id = crawl_id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut crawl = load_crawl(&tx, None, &crawl_id)?.ok_or_else(crawl_not_found)?;
            crawl.state = CrawlState::Canceled;
            crawl.finished = Some(finished);
            store_crawl(&tx, &crawl)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn add_collection(&self, oid: &str, crawl_id: &str, collection_id: &str) -> Result<()> {
        let oid = oid.to_string();
        let crawl_id = crawl_id.to_string();
        let collection_id = collection_id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut crawl = load_crawl(&tx, Some(&oid), &crawl_id)?.ok_or_else(crawl_not_found)?;
            apply_add_collection(&mut crawl, &collection_id)?;
            store_crawl(&tx, &crawl)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn remove_collection(
        &self,
        oid: &str,
        crawl_id: &str,
        collection_id: &str,
    ) -> Result<()> {
        let oid = oid.to_string();
        let crawl_id = crawl_id.to_string();
        let collection_id = collection_id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut crawl = load_crawl(&tx, Some(&oid), &crawl_id)?.ok_or_else(crawl_not_found)?;
            if crawl.collection_ids.remove(&collection_id) {
                store_crawl(&tx, &crawl)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete_crawls(
        &self,
        oid: &str,
        crawl_ids: &[String],
        crawl_type: CrawlType,
    ) -> Result<Vec<String>> {
        if crawl_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut params = Vec::with_capacity(crawl_ids.len() + 2);
        params.push(oid.to_string());
        params.push(crawl_type.as_str().to_string());
        params.extend(crawl_ids.iter().cloned());
        let placeholders = (3..=params.len())
            .map(|idx| format!("?{idx}"))
            .collect::<Vec<_>>()
            .join(", ");

        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "DELETE FROM crawls
                 WHERE org_id = ?1 AND crawl_type = ?2 AND id IN ({placeholders})
                 RETURNING id"
            ))?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
                row.get::<_, String>(0)
            })?;
            let mut deleted = rows.collect::<std::result::Result<Vec<_>, _>>()?;
            deleted.sort();
            Ok(deleted)
        })
        .await
    }
}

fn init_schema(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS orgs (
            id TEXT PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            users_json TEXT NOT NULL,
            quotas_json TEXT NOT NULL,
            bytes_stored INTEGER NOT NULL DEFAULT 0,
            bytes_stored_crawls INTEGER NOT NULL DEFAULT 0,
            bytes_stored_uploads INTEGER NOT NULL DEFAULT 0,
            bytes_stored_profiles INTEGER NOT NULL DEFAULT 0,
            gifted_exec_seconds_available INTEGER NOT NULL DEFAULT 0,
            extra_exec_seconds_available INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS org_time_counters (
            org_id TEXT NOT NULL,
            counter TEXT NOT NULL,
            period TEXT NOT NULL,
            seconds INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (org_id, counter, period)
        );

        CREATE TABLE IF NOT EXISTS org_quota_updates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            org_id TEXT NOT NULL,
            modified TEXT NOT NULL,
            update_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_org_quota_updates_org_id
            ON org_quota_updates(org_id, id);

        CREATE TABLE IF NOT EXISTS crawls (
            id TEXT PRIMARY KEY NOT NULL,
            org_id TEXT NOT NULL,
            crawl_type TEXT NOT NULL,
            value_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_crawls_org_type
            ON crawls(org_id, crawl_type);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> std::result::Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn ensure_org(conn: &Connection, oid: &str) -> Result<()> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM orgs WHERE id = ?1",
            rusqlite::params![oid],
            |row| row.get(0),
        )
        .optional()?;
    exists.map(|_| ()).ok_or_else(org_not_found)
}

fn counter_seconds(conn: &Connection, oid: &str, counter: TimeCounter, period: &str) -> Result<u64> {
    let seconds: Option<i64> = conn
        .query_row(
            "SELECT seconds FROM org_time_counters
             WHERE org_id = ?1 AND counter = ?2 AND period = ?3",
            rusqlite::params![oid, counter.as_str(), period],
            |row| row.get(0),
        )
        .optional()?;
    Ok(seconds.map(i64_to_u64).unwrap_or(0))
}

fn add_counter_seconds(
    conn: &Connection,
    oid: &str,
    counter: TimeCounter,
    period: &str,
    seconds: u64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO org_time_counters (org_id, counter, period, seconds)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(org_id, counter, period)
         DO UPDATE SET seconds = seconds + excluded.seconds",
        rusqlite::params![oid, counter.as_str(), period, u64_to_i64(seconds)],
    )?;
    Ok(())
}

fn load_org(conn: &Connection, oid: &str) -> Result<Organization> {
    let row = conn
        .query_row(
            "SELECT name, users_json, quotas_json,
                    bytes_stored, bytes_stored_crawls, bytes_stored_uploads, bytes_stored_profiles,
                    gifted_exec_seconds_available, extra_exec_seconds_available
             FROM orgs WHERE id = ?1",
            rusqlite::params![oid],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    [
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                    ],
                ))
            },
        )
        .optional()?;
    let Some((name, users_json, quotas_json, counters)) = row else {
        return Err(org_not_found());
    };

    let mut org = Organization::new(oid, name);
    org.users = serde_json::from_str(&users_json)?;
    org.quotas = serde_json::from_str::<OrgQuotas>(&quotas_json)?;
    let [total, crawls, uploads, profiles, gifted, extra] = counters.map(i64_to_u64);
    org.bytes_stored = total;
    org.bytes_stored_crawls = crawls;
    org.bytes_stored_uploads = uploads;
    org.bytes_stored_profiles = profiles;
    org.gifted_exec_seconds_available = gifted;
    org.extra_exec_seconds_available = extra;

    let mut stmt = conn.prepare(
        "SELECT counter, period, seconds FROM org_time_counters WHERE org_id = ?1",
    )?;
    let rows = stmt.query_map(rusqlite::params![oid], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;
    for row in rows {
        let (counter, period, seconds) = row?;
        if let Some(counter) = TimeCounter::from_str_opt(&counter) {
            org.time_counter_mut(counter)
                .insert(period, i64_to_u64(seconds));
        }
    }

    let mut stmt = conn.prepare(
        "SELECT modified, update_json FROM org_quota_updates WHERE org_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(rusqlite::params![oid], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (modified, update_json) = row?;
        org.quota_updates.push(QuotaUpdateRecord {
            update: serde_json::from_str(&update_json)?,
            modified: parse_ts(&modified)?,
        });
    }
    Ok(org)
}

fn load_crawl(conn: &Connection, oid: Option<&str>, crawl_id: &str) -> Result<Option<BaseCrawl>> {
    let raw: Option<(String, String)> = conn
        .query_row(
            "SELECT org_id, value_json FROM crawls WHERE id = ?1",
            rusqlite::params![crawl_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((org_id, value_json)) = raw else {
        return Ok(None);
    };
    if oid.is_some_and(|oid| oid != org_id) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&value_json)?))
}

fn store_crawl(conn: &Connection, crawl: &BaseCrawl) -> Result<()> {
    conn.execute(
        "UPDATE crawls SET value_json = ?2 WHERE id = ?1",
        rusqlite::params![crawl.id, serde_json::to_string(crawl)?],
    )?;
    Ok(())
}

fn pool_column(pool: RolloverPool) -> &'static str {
    match pool {
        RolloverPool::Gifted => "gifted_exec_seconds_available",
        RolloverPool::Extra => "extra_exec_seconds_available",
    }
}

fn bytes_column(kind: StorageKind) -> &'static str {
    match kind {
        StorageKind::Crawl => "bytes_stored_crawls",
        StorageKind::Upload => "bytes_stored_uploads",
        StorageKind::Profile => "bytes_stored_profiles",
    }
}

fn format_ts(ts: OffsetDateTime) -> Result<String> {
    ts.format(&Rfc3339)
        .map_err(|err| StoreError::Timestamp(err.to_string()).into())
}

fn parse_ts(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|err| StoreError::Timestamp(err.to_string()).into())
}

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn i64_to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
