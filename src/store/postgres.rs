//! Postgres-backed `Store` implementation. `query` excludes rows shadowed by
//! a newer replaceable/parameterized-replaceable version and tombstoned ids,
//! so a `REQ` scan never surfaces a superseded event.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, QueryBuilder, Row};

use crate::error::Result;
use crate::model::{Event, Filter};
use crate::store::{SaveOutcome, Store};

pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let store = PostgresStore { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                pubkey TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                kind INTEGER NOT NULL,
                tags JSONB NOT NULL,
                content TEXT NOT NULL,
                sig TEXT NOT NULL,
                visible BOOLEAN NOT NULL DEFAULT TRUE,
                received_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS events_pubkey_kind_idx ON events (pubkey, kind)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS events_kind_created_at_idx ON events (kind, created_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tombstones (
                id TEXT PRIMARY KEY,
                tombstoned_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<Event> {
        let tags_json: serde_json::Value = row.try_get("tags")?;
        let tags: Vec<Vec<String>> = serde_json::from_value(tags_json)?;
        Ok(Event {
            id: row.try_get("id")?,
            pubkey: row.try_get("pubkey")?,
            created_at: row.try_get("created_at")?,
            kind: row.try_get::<i32, _>("kind")? as u16,
            tags,
            content: row.try_get("content")?,
            sig: row.try_get("sig")?,
        })
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn save(&self, event: &Event) -> Result<SaveOutcome> {
        let tags_json = serde_json::to_value(&event.tags)?;
        let result = sqlx::query(
            "INSERT INTO events (id, pubkey, created_at, kind, tags, content, sig)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&event.id)
        .bind(&event.pubkey)
        .bind(event.created_at)
        .bind(event.kind as i32)
        .bind(tags_json)
        .bind(&event.content)
        .bind(&event.sig)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(SaveOutcome::Duplicate)
        } else {
            Ok(SaveOutcome::Saved)
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Event>> {
        let row = sqlx::query(
            "SELECT id, pubkey, created_at, kind, tags, content, sig FROM events WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_event).transpose()
    }

    async fn query(&self, filter: &Filter, limit: usize) -> Result<Vec<Event>> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT e.id, e.pubkey, e.created_at, e.kind, e.tags, e.content, e.sig
             FROM events e
             WHERE e.visible = TRUE
               AND NOT EXISTS (SELECT 1 FROM tombstones t WHERE t.id = e.id)",
        );

        if let Some(ids) = &filter.ids {
            if !ids.is_empty() {
                qb.push(" AND (");
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        qb.push(" OR ");
                    }
                    // ids may be hex prefixes shorter than the full id.
                    qb.push("e.id LIKE ").push_bind(format!("{id}%"));
                }
                qb.push(")");
            }
        }
        if let Some(authors) = &filter.authors {
            if !authors.is_empty() {
                qb.push(" AND e.pubkey = ANY(");
                qb.push_bind(authors.clone());
                qb.push(")");
            }
        }
        if let Some(kinds) = &filter.kinds {
            if !kinds.is_empty() {
                let kinds_i32: Vec<i32> = kinds.iter().map(|k| *k as i32).collect();
                qb.push(" AND e.kind = ANY(");
                qb.push_bind(kinds_i32);
                qb.push(")");
            }
        }
        if let Some(since) = filter.since {
            qb.push(" AND e.created_at >= ").push_bind(since);
        }
        if let Some(until) = filter.until {
            qb.push(" AND e.created_at <= ").push_bind(until);
        }
        for (tag_char, values) in &filter.tags {
            let key = tag_char.to_string();
            qb.push(
                " AND EXISTS (SELECT 1 FROM jsonb_array_elements(e.tags) AS t
                              WHERE t->>0 = ",
            )
            .push_bind(key)
            .push(" AND t->>1 = ANY(")
            .push_bind(values.iter().cloned().collect::<Vec<_>>())
            .push("))");
        }

        qb.push(" ORDER BY e.created_at DESC, e.id ASC LIMIT ")
            .push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn is_tombstoned(&self, id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM tombstones WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn delete(&self, id: &str, tombstone: bool) -> Result<()> {
        sqlx::query("UPDATE events SET visible = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if tombstone {
            sqlx::query("INSERT INTO tombstones (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
                .bind(id)
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    async fn replaceable_existing(&self, pubkey: &str, kind: u16) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT id, pubkey, created_at, kind, tags, content, sig
             FROM events
             WHERE pubkey = $1 AND kind = $2 AND visible = TRUE
               AND NOT EXISTS (SELECT 1 FROM tombstones t WHERE t.id = events.id)",
        )
        .bind(pubkey)
        .bind(kind as i32)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn parameterized_existing(
        &self,
        pubkey: &str,
        kind: u16,
        d_tag: &str,
    ) -> Result<Vec<Event>> {
        let candidates = self.replaceable_existing(pubkey, kind).await?;
        Ok(candidates
            .into_iter()
            .filter(|e| e.d_tag() == d_tag)
            .collect())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
