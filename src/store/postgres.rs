//! PostgreSQL store: row-locked reservation with `FOR UPDATE SKIP LOCKED`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::info;

use super::{NewBinding, NewDeliverable, NewJobDefinition, NewNode, NewQueue, Store};
use crate::error::{Error, Result};
use crate::model::{
    BindingId, Deliverable, DeliverableId, DeploymentBinding, EnqueueRequest, HistoryRecord,
    InstanceFilter, InstanceId, JobDefId, JobDefinition, JobInstance, Message, Node, NodeId, Queue,
    QueueId, UserTags,
};
use crate::state::InstanceState;

const UNIQUE_VIOLATION: &str = "23505";

/// Shared columns of the live and history instance tables.
const INSTANCE_COLUMNS: &str = "id, job_def_id, queue_id, state, priority, highlander, \
     enqueue_time, attribution_time, start_time, end_time, attributed_node, progress, \
     kill_requested, restart_count, parent_id, end_reason, tag_application, tag_module, \
     keyword1, keyword2, keyword3, session_id, username, mail";

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS queue (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        description TEXT NOT NULL DEFAULT '',
        default_priority INT NOT NULL DEFAULT 0,
        max_size INT NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS node (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        host TEXT NOT NULL DEFAULT '',
        port INT NOT NULL DEFAULT 0,
        repo_path TEXT NOT NULL,
        tmp_path TEXT NOT NULL,
        dl_repo TEXT NOT NULL,
        enabled BOOLEAN NOT NULL DEFAULT TRUE
    )",
    "CREATE TABLE IF NOT EXISTS job_def (
        id BIGSERIAL PRIMARY KEY,
        application_name TEXT NOT NULL UNIQUE,
        entry_point TEXT NOT NULL,
        artifact_path TEXT NOT NULL,
        queue_id BIGINT NOT NULL REFERENCES queue(id),
        can_restart BOOLEAN NOT NULL DEFAULT FALSE,
        highlander BOOLEAN NOT NULL DEFAULT FALSE,
        max_time_running_ms BIGINT
    )",
    "CREATE TABLE IF NOT EXISTS job_def_parameter (
        job_def_id BIGINT NOT NULL REFERENCES job_def(id) ON DELETE CASCADE,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (job_def_id, key)
    )",
    "CREATE TABLE IF NOT EXISTS deployment (
        id BIGSERIAL PRIMARY KEY,
        node_id BIGINT NOT NULL REFERENCES node(id),
        queue_id BIGINT NOT NULL REFERENCES queue(id),
        max_concurrent INT NOT NULL,
        poll_interval_ms BIGINT,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        UNIQUE (node_id, queue_id)
    )",
    "CREATE TABLE IF NOT EXISTS job_instance (
        id BIGSERIAL PRIMARY KEY,
        job_def_id BIGINT NOT NULL,
        queue_id BIGINT NOT NULL,
        state TEXT NOT NULL,
        priority INT NOT NULL,
        highlander BOOLEAN NOT NULL DEFAULT FALSE,
        enqueue_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        attribution_time TIMESTAMPTZ,
        start_time TIMESTAMPTZ,
        end_time TIMESTAMPTZ,
        attributed_node BIGINT,
        progress INT,
        kill_requested BOOLEAN NOT NULL DEFAULT FALSE,
        restart_count INT NOT NULL DEFAULT 0,
        parent_id BIGINT,
        end_reason TEXT,
        tag_application TEXT,
        tag_module TEXT,
        keyword1 TEXT,
        keyword2 TEXT,
        keyword3 TEXT,
        session_id TEXT,
        username TEXT,
        mail TEXT
    )",
    "CREATE INDEX IF NOT EXISTS job_instance_pickup
        ON job_instance (queue_id, state, priority DESC, enqueue_time ASC, id ASC)",
    // Database-level backstop for the single-live-instance rule.
    "CREATE UNIQUE INDEX IF NOT EXISTS job_instance_single_active
        ON job_instance (job_def_id)
        WHERE highlander AND state IN ('ATTRIBUTED', 'RUNNING')",
    "CREATE TABLE IF NOT EXISTS instance_parameter (
        instance_id BIGINT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (instance_id, key)
    )",
    "CREATE TABLE IF NOT EXISTS message (
        id BIGSERIAL PRIMARY KEY,
        instance_id BIGINT NOT NULL,
        body TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS message_by_instance ON message (instance_id, id)",
    "CREATE TABLE IF NOT EXISTS deliverable (
        id BIGSERIAL PRIMARY KEY,
        instance_id BIGINT NOT NULL,
        file_path TEXT NOT NULL,
        label TEXT,
        file_hash TEXT NOT NULL,
        size BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS deliverable_by_instance ON deliverable (instance_id)",
    "CREATE TABLE IF NOT EXISTS job_history (
        id BIGINT PRIMARY KEY,
        job_def_id BIGINT NOT NULL,
        queue_id BIGINT NOT NULL,
        state TEXT NOT NULL,
        priority INT NOT NULL,
        highlander BOOLEAN NOT NULL,
        enqueue_time TIMESTAMPTZ NOT NULL,
        attribution_time TIMESTAMPTZ,
        start_time TIMESTAMPTZ,
        end_time TIMESTAMPTZ,
        attributed_node BIGINT,
        progress INT,
        kill_requested BOOLEAN NOT NULL,
        restart_count INT NOT NULL,
        parent_id BIGINT,
        end_reason TEXT,
        tag_application TEXT,
        tag_module TEXT,
        keyword1 TEXT,
        keyword2 TEXT,
        keyword3 TEXT,
        session_id TEXT,
        username TEXT,
        mail TEXT,
        archived_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
];

#[derive(Debug, FromRow)]
struct InstanceRow {
    id: i64,
    job_def_id: i64,
    queue_id: i64,
    state: String,
    priority: i32,
    highlander: bool,
    enqueue_time: DateTime<Utc>,
    attribution_time: Option<DateTime<Utc>>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    attributed_node: Option<i64>,
    progress: Option<i32>,
    kill_requested: bool,
    restart_count: i32,
    parent_id: Option<i64>,
    end_reason: Option<String>,
    tag_application: Option<String>,
    tag_module: Option<String>,
    keyword1: Option<String>,
    keyword2: Option<String>,
    keyword3: Option<String>,
    session_id: Option<String>,
    username: Option<String>,
    mail: Option<String>,
}

impl InstanceRow {
    fn into_instance(self, parameters: HashMap<String, String>) -> Result<JobInstance> {
        let state = InstanceState::parse(&self.state)
            .ok_or_else(|| Error::BackendUnavailable(format!("bad state column: {}", self.state)))?;
        Ok(JobInstance {
            id: InstanceId(self.id),
            job_def: JobDefId(self.job_def_id),
            queue: QueueId(self.queue_id),
            state,
            priority: self.priority,
            highlander: self.highlander,
            enqueue_time: self.enqueue_time,
            attribution_time: self.attribution_time,
            start_time: self.start_time,
            end_time: self.end_time,
            attributed_node: self.attributed_node.map(NodeId),
            progress: self.progress,
            kill_requested: self.kill_requested,
            restart_count: self.restart_count,
            tags: UserTags {
                application: self.tag_application,
                module: self.tag_module,
                keyword1: self.keyword1,
                keyword2: self.keyword2,
                keyword3: self.keyword3,
                session_id: self.session_id,
                user: self.username,
                mail: self.mail,
            },
            parameters,
            parent: self.parent_id.map(InstanceId),
            end_reason: self.end_reason,
        })
    }
}

fn backend(err: sqlx::Error) -> Error {
    Error::BackendUnavailable(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == UNIQUE_VIOLATION)
        .unwrap_or(false)
}

fn queue_from_row(row: PgRow) -> Queue {
    Queue {
        id: QueueId(row.get("id")),
        name: row.get("name"),
        description: row.get("description"),
        default_priority: row.get("default_priority"),
        max_size: row.get("max_size"),
    }
}

fn node_from_row(row: PgRow) -> Node {
    Node {
        id: NodeId(row.get("id")),
        name: row.get("name"),
        host: row.get("host"),
        port: row.get("port"),
        repo_path: row.get::<String, _>("repo_path").into(),
        tmp_path: row.get::<String, _>("tmp_path").into(),
        dl_repo: row.get::<String, _>("dl_repo").into(),
        enabled: row.get("enabled"),
    }
}

fn binding_from_row(row: PgRow) -> DeploymentBinding {
    DeploymentBinding {
        id: BindingId(row.get("id")),
        node: NodeId(row.get("node_id")),
        queue: QueueId(row.get("queue_id")),
        max_concurrent: row.get("max_concurrent"),
        poll_interval_ms: row.get("poll_interval_ms"),
        enabled: row.get("enabled"),
    }
}

fn deliverable_from_row(row: PgRow) -> Deliverable {
    Deliverable {
        id: DeliverableId(row.get("id")),
        instance: InstanceId(row.get("instance_id")),
        file_path: row.get::<String, _>("file_path").into(),
        label: row.get("label"),
        file_hash: row.get("file_hash"),
        size: row.get("size"),
        created_at: row.get("created_at"),
    }
}

/// Store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and apply the idempotent schema migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await
            .map_err(backend)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        info!("schema migrations applied");
        Ok(())
    }

    async fn load_parameters(
        tx: impl sqlx::PgExecutor<'_>,
        ids: &[i64],
    ) -> Result<HashMap<i64, HashMap<String, String>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows =
            sqlx::query("SELECT instance_id, key, value FROM instance_parameter WHERE instance_id = ANY($1)")
                .bind(ids)
                .fetch_all(tx)
                .await
                .map_err(backend)?;
        let mut out: HashMap<i64, HashMap<String, String>> = HashMap::new();
        for row in rows {
            out.entry(row.get("instance_id"))
                .or_default()
                .insert(row.get("key"), row.get("value"));
        }
        Ok(out)
    }

    async fn fetch_instance(
        &self,
        table: &str,
        id: InstanceId,
    ) -> Result<Option<JobInstance>> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM {table} WHERE id = $1");
        let row = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut params = Self::load_parameters(&self.pool, &[id.0]).await?;
        Some(row.into_instance(params.remove(&id.0).unwrap_or_default())).transpose()
    }

    async fn archive_in_tx(tx: &mut Transaction<'_, Postgres>, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let insert = format!(
            "INSERT INTO job_history ({INSTANCE_COLUMNS}, archived_at)
             SELECT {INSTANCE_COLUMNS}, NOW() FROM job_instance WHERE id = ANY($1)
             ON CONFLICT (id) DO NOTHING"
        );
        sqlx::query(&insert)
            .bind(ids)
            .execute(tx.as_mut())
            .await
            .map_err(backend)?;
        sqlx::query("DELETE FROM job_instance WHERE id = ANY($1)")
            .bind(ids)
            .execute(tx.as_mut())
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_queue(&self, queue: NewQueue) -> Result<QueueId> {
        let row = sqlx::query(
            "INSERT INTO queue (name, description, default_priority, max_size)
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(&queue.name)
        .bind(&queue.description)
        .bind(queue.default_priority)
        .bind(queue.max_size)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Invalid(format!("queue {} already exists", queue.name))
            } else {
                backend(e)
            }
        })?;
        Ok(QueueId(row.get("id")))
    }

    async fn get_queue(&self, id: QueueId) -> Result<Queue> {
        sqlx::query("SELECT * FROM queue WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(queue_from_row)
            .ok_or_else(|| Error::not_found("queue", id))
    }

    async fn get_queue_by_name(&self, name: &str) -> Result<Queue> {
        sqlx::query("SELECT * FROM queue WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(queue_from_row)
            .ok_or_else(|| Error::not_found("queue", name))
    }

    async fn create_node(&self, node: NewNode) -> Result<NodeId> {
        let row = sqlx::query(
            "INSERT INTO node (name, host, port, repo_path, tmp_path, dl_repo)
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(&node.name)
        .bind(&node.host)
        .bind(node.port)
        .bind(node.repo_path.to_string_lossy().into_owned())
        .bind(node.tmp_path.to_string_lossy().into_owned())
        .bind(node.dl_repo.to_string_lossy().into_owned())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Invalid(format!("node {} already exists", node.name))
            } else {
                backend(e)
            }
        })?;
        Ok(NodeId(row.get("id")))
    }

    async fn get_node(&self, id: NodeId) -> Result<Node> {
        sqlx::query("SELECT * FROM node WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(node_from_row)
            .ok_or_else(|| Error::not_found("node", id))
    }

    async fn get_node_by_name(&self, name: &str) -> Result<Node> {
        sqlx::query("SELECT * FROM node WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(node_from_row)
            .ok_or_else(|| Error::not_found("node", name))
    }

    async fn set_node_enabled(&self, id: NodeId, enabled: bool) -> Result<()> {
        let done = sqlx::query("UPDATE node SET enabled = $2 WHERE id = $1")
            .bind(id.0)
            .bind(enabled)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if done.rows_affected() == 0 {
            return Err(Error::not_found("node", id));
        }
        Ok(())
    }

    async fn create_job_definition(&self, def: NewJobDefinition) -> Result<JobDefId> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let row = sqlx::query(
            "INSERT INTO job_def (application_name, entry_point, artifact_path, queue_id,
                                  can_restart, highlander, max_time_running_ms)
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
        )
        .bind(&def.application_name)
        .bind(&def.entry_point)
        .bind(&def.artifact_path)
        .bind(def.default_queue.0)
        .bind(def.can_restart)
        .bind(def.highlander)
        .bind(def.max_time_running_ms)
        .fetch_one(tx.as_mut())
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Invalid(format!("definition {} already exists", def.application_name))
            } else {
                backend(e)
            }
        })?;
        let id: i64 = row.get("id");
        for (key, value) in &def.default_parameters {
            sqlx::query("INSERT INTO job_def_parameter (job_def_id, key, value) VALUES ($1, $2, $3)")
                .bind(id)
                .bind(key)
                .bind(value)
                .execute(tx.as_mut())
                .await
                .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(JobDefId(id))
    }

    async fn get_job_definition(&self, id: JobDefId) -> Result<JobDefinition> {
        let row = sqlx::query("SELECT * FROM job_def WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| Error::not_found("job definition", id))?;
        def_from_row(&self.pool, row).await
    }

    async fn get_job_definition_by_name(&self, application_name: &str) -> Result<JobDefinition> {
        let row = sqlx::query("SELECT * FROM job_def WHERE application_name = $1")
            .bind(application_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| Error::not_found("job definition", application_name))?;
        def_from_row(&self.pool, row).await
    }

    async fn delete_job_definition(&self, id: JobDefId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let referenced: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM job_instance WHERE job_def_id = $1)
                 OR EXISTS (SELECT 1 FROM job_history WHERE job_def_id = $1)",
        )
        .bind(id.0)
        .fetch_one(tx.as_mut())
        .await
        .map_err(backend)?;
        if referenced {
            return Err(Error::Invalid(format!("definition {id} still has instances")));
        }
        let done = sqlx::query("DELETE FROM job_def WHERE id = $1")
            .bind(id.0)
            .execute(tx.as_mut())
            .await
            .map_err(backend)?;
        if done.rows_affected() == 0 {
            return Err(Error::not_found("job definition", id));
        }
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn create_binding(&self, binding: NewBinding) -> Result<BindingId> {
        let row = sqlx::query(
            "INSERT INTO deployment (node_id, queue_id, max_concurrent, poll_interval_ms, enabled)
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(binding.node.0)
        .bind(binding.queue.0)
        .bind(binding.max_concurrent)
        .bind(binding.poll_interval_ms)
        .bind(binding.enabled)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Invalid("binding already exists".to_string())
            } else {
                backend(e)
            }
        })?;
        Ok(BindingId(row.get("id")))
    }

    async fn get_binding(&self, id: BindingId) -> Result<DeploymentBinding> {
        sqlx::query("SELECT * FROM deployment WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(binding_from_row)
            .ok_or_else(|| Error::not_found("binding", id))
    }

    async fn update_binding(&self, binding: DeploymentBinding) -> Result<()> {
        let done = sqlx::query(
            "UPDATE deployment SET max_concurrent = $2, poll_interval_ms = $3, enabled = $4
             WHERE id = $1",
        )
        .bind(binding.id.0)
        .bind(binding.max_concurrent)
        .bind(binding.poll_interval_ms)
        .bind(binding.enabled)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if done.rows_affected() == 0 {
            return Err(Error::not_found("binding", binding.id));
        }
        Ok(())
    }

    async fn delete_binding(&self, id: BindingId) -> Result<()> {
        let done = sqlx::query("DELETE FROM deployment WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if done.rows_affected() == 0 {
            return Err(Error::not_found("binding", id));
        }
        Ok(())
    }

    async fn bindings_for_node(&self, node: NodeId) -> Result<Vec<DeploymentBinding>> {
        let rows = sqlx::query("SELECT * FROM deployment WHERE node_id = $1 ORDER BY id")
            .bind(node.0)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows.into_iter().map(binding_from_row).collect())
    }

    async fn enqueue(&self, request: EnqueueRequest) -> Result<InstanceId> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let def_row = sqlx::query("SELECT * FROM job_def WHERE application_name = $1")
            .bind(&request.application_name)
            .fetch_optional(tx.as_mut())
            .await
            .map_err(backend)?
            .ok_or_else(|| Error::not_found("job definition", &request.application_name))?;
        let def_id: i64 = def_row.get("id");
        let highlander: bool = def_row.get("highlander");
        let default_queue: i64 = def_row.get("queue_id");
        let queue_id = request.queue.map(|q| q.0).unwrap_or(default_queue);

        // Lock the queue row so the size check serializes with concurrent
        // enqueues on the same queue.
        let queue_row = sqlx::query("SELECT * FROM queue WHERE id = $1 FOR UPDATE")
            .bind(queue_id)
            .fetch_optional(tx.as_mut())
            .await
            .map_err(backend)?
            .ok_or_else(|| Error::not_found("queue", QueueId(queue_id)))?;
        let max_size: i32 = queue_row.get("max_size");
        let default_priority: i32 = queue_row.get("default_priority");
        if max_size > 0 {
            let submitted: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM job_instance WHERE queue_id = $1 AND state = 'SUBMITTED'",
            )
            .bind(queue_id)
            .fetch_one(tx.as_mut())
            .await
            .map_err(backend)?;
            if submitted >= max_size as i64 {
                return Err(Error::QueueFull(queue_row.get("name")));
            }
        }

        let row = sqlx::query(
            "INSERT INTO job_instance (job_def_id, queue_id, state, priority, highlander,
                 restart_count, parent_id, tag_application, tag_module, keyword1, keyword2,
                 keyword3, session_id, username, mail)
             VALUES ($1, $2, 'SUBMITTED', $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             RETURNING id",
        )
        .bind(def_id)
        .bind(queue_id)
        .bind(request.priority.unwrap_or(default_priority))
        .bind(highlander)
        .bind(request.restart_count)
        .bind(request.parent.map(|p| p.0))
        .bind(&request.tags.application)
        .bind(&request.tags.module)
        .bind(&request.tags.keyword1)
        .bind(&request.tags.keyword2)
        .bind(&request.tags.keyword3)
        .bind(&request.tags.session_id)
        .bind(&request.tags.user)
        .bind(&request.tags.mail)
        .fetch_one(tx.as_mut())
        .await
        .map_err(backend)?;
        let id: i64 = row.get("id");
        for (key, value) in &request.parameters {
            sqlx::query("INSERT INTO instance_parameter (instance_id, key, value) VALUES ($1, $2, $3)")
                .bind(id)
                .bind(key)
                .bind(value)
                .execute(tx.as_mut())
                .await
                .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(InstanceId(id))
    }

    async fn reserve_next(
        &self,
        node: NodeId,
        queue: QueueId,
        limit: usize,
    ) -> Result<Vec<JobInstance>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let sql = format!(
            "WITH locked AS (
                 SELECT id, job_def_id, highlander, priority, enqueue_time
                 FROM job_instance ji
                 WHERE queue_id = $2
                   AND state = 'SUBMITTED'
                   AND NOT (highlander AND EXISTS (
                        SELECT 1 FROM job_instance active
                        WHERE active.job_def_id = ji.job_def_id
                          AND active.state IN ('ATTRIBUTED', 'RUNNING')))
                 ORDER BY priority DESC, enqueue_time ASC, id ASC
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             ),
             picked AS (
                 SELECT id FROM locked WHERE NOT highlander
                 UNION ALL
                 (SELECT DISTINCT ON (job_def_id) id FROM locked WHERE highlander
                  ORDER BY job_def_id, priority DESC, enqueue_time ASC, id ASC)
             )
             UPDATE job_instance ji
             SET state = 'ATTRIBUTED', attributed_node = $1, attribution_time = NOW()
             FROM picked
             WHERE ji.id = picked.id
             RETURNING {}",
            INSTANCE_COLUMNS
                .split(", ")
                .map(|c| format!("ji.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let rows = match sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(node.0)
            .bind(queue.0)
            .bind(limit as i64)
            .fetch_all(tx.as_mut())
            .await
        {
            Ok(rows) => rows,
            // Lost the single-active race to another node; the next tick
            // retries.
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await.ok();
                return Ok(Vec::new());
            }
            Err(e) => return Err(backend(e)),
        };
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let mut params = Self::load_parameters(tx.as_mut(), &ids).await?;
        tx.commit().await.map_err(backend)?;

        let mut reserved = rows
            .into_iter()
            .map(|row| {
                let p = params.remove(&row.id).unwrap_or_default();
                row.into_instance(p)
            })
            .collect::<Result<Vec<_>>>()?;
        reserved.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.enqueue_time.cmp(&b.enqueue_time))
                .then(a.id.cmp(&b.id))
        });
        Ok(reserved)
    }

    async fn transition(
        &self,
        id: InstanceId,
        from: InstanceState,
        to: InstanceState,
        reason: Option<String>,
    ) -> Result<()> {
        if !from.can_transition_to(to) {
            let actual = self.get_state(id).await?;
            return Err(Error::StateConflict {
                id,
                expected: from,
                actual,
            });
        }
        let done = if to.is_terminal() {
            let reason = reason.unwrap_or_else(|| to.to_string().to_lowercase());
            sqlx::query(
                "UPDATE job_instance SET state = $3, end_time = NOW(), end_reason = $4
                 WHERE id = $1 AND state = $2",
            )
            .bind(id.0)
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(reason)
            .execute(&self.pool)
            .await
            .map_err(backend)?
        } else {
            let sql = match to {
                InstanceState::Running => {
                    "UPDATE job_instance SET state = $3, start_time = NOW()
                     WHERE id = $1 AND state = $2"
                }
                InstanceState::Submitted => {
                    "UPDATE job_instance
                     SET state = $3, attributed_node = NULL, attribution_time = NULL
                     WHERE id = $1 AND state = $2"
                }
                _ => "UPDATE job_instance SET state = $3 WHERE id = $1 AND state = $2",
            };
            sqlx::query(sql)
                .bind(id.0)
                .bind(from.as_str())
                .bind(to.as_str())
                .execute(&self.pool)
                .await
                .map_err(backend)?
        };
        if done.rows_affected() == 1 {
            return Ok(());
        }
        // Lost the CAS; report what the row actually holds.
        let actual = self.get_state(id).await?;
        Err(Error::StateConflict {
            id,
            expected: from,
            actual,
        })
    }

    async fn request_kill(&self, id: InstanceId) -> Result<()> {
        let done = sqlx::query("UPDATE job_instance SET kill_requested = TRUE WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if done.rows_affected() == 1 {
            return Ok(());
        }
        let archived: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM job_history WHERE id = $1)")
                .bind(id.0)
                .fetch_one(&self.pool)
                .await
                .map_err(backend)?;
        if archived {
            Ok(())
        } else {
            Err(Error::not_found("instance", id))
        }
    }

    async fn kill_requested(&self, id: InstanceId) -> Result<bool> {
        let live: Option<bool> =
            sqlx::query_scalar("SELECT kill_requested FROM job_instance WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        if let Some(flag) = live {
            return Ok(flag);
        }
        let archived: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM job_history WHERE id = $1)")
                .bind(id.0)
                .fetch_one(&self.pool)
                .await
                .map_err(backend)?;
        if archived {
            Ok(false)
        } else {
            Err(Error::not_found("instance", id))
        }
    }

    async fn set_priority(&self, id: InstanceId, priority: i32) -> Result<()> {
        let done = sqlx::query("UPDATE job_instance SET priority = $2 WHERE id = $1")
            .bind(id.0)
            .bind(priority)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if done.rows_affected() == 0 {
            return Err(Error::not_found("instance", id));
        }
        Ok(())
    }

    async fn record_message(&self, id: InstanceId, body: String) -> Result<()> {
        sqlx::query("INSERT INTO message (instance_id, body) VALUES ($1, $2)")
            .bind(id.0)
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn update_progress(&self, id: InstanceId, progress: i32) -> Result<()> {
        let done = sqlx::query("UPDATE job_instance SET progress = $2 WHERE id = $1")
            .bind(id.0)
            .bind(progress)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if done.rows_affected() == 0 {
            return Err(Error::not_found("instance", id));
        }
        Ok(())
    }

    async fn record_deliverable(&self, deliverable: NewDeliverable) -> Result<DeliverableId> {
        let row = sqlx::query(
            "INSERT INTO deliverable (instance_id, file_path, label, file_hash, size)
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(deliverable.instance.0)
        .bind(deliverable.file_path.to_string_lossy().into_owned())
        .bind(&deliverable.label)
        .bind(&deliverable.file_hash)
        .bind(deliverable.size)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok(DeliverableId(row.get("id")))
    }

    async fn archive_terminal(&self, id: InstanceId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let state: Option<String> =
            sqlx::query_scalar("SELECT state FROM job_instance WHERE id = $1 FOR UPDATE")
                .bind(id.0)
                .fetch_optional(tx.as_mut())
                .await
                .map_err(backend)?;
        let Some(state) = state else {
            let archived: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM job_history WHERE id = $1)")
                    .bind(id.0)
                    .fetch_one(tx.as_mut())
                    .await
                    .map_err(backend)?;
            return if archived {
                Ok(())
            } else {
                Err(Error::not_found("instance", id))
            };
        };
        let state = InstanceState::parse(&state)
            .ok_or_else(|| Error::BackendUnavailable(format!("bad state column: {state}")))?;
        if !state.is_terminal() {
            return Err(Error::StateConflict {
                id,
                expected: InstanceState::Ended,
                actual: state,
            });
        }
        Self::archive_in_tx(&mut tx, &[id.0]).await?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn recover_crashed(&self, node: NodeId) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let rows = sqlx::query(
            "UPDATE job_instance
             SET state = 'CRASHED', end_time = NOW(), end_reason = 'node crash recovery'
             WHERE attributed_node = $1 AND state IN ('ATTRIBUTED', 'RUNNING')
             RETURNING id",
        )
        .bind(node.0)
        .fetch_all(tx.as_mut())
        .await
        .map_err(backend)?;
        let ids: Vec<i64> = rows.iter().map(|r| r.get("id")).collect();
        Self::archive_in_tx(&mut tx, &ids).await?;
        // Terminal rows whose archival was interrupted mid-flight.
        let orphaned: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM job_instance
             WHERE state IN ('ENDED', 'CRASHED', 'KILLED', 'CANCELLED')",
        )
        .fetch_all(tx.as_mut())
        .await
        .map_err(backend)?;
        Self::archive_in_tx(&mut tx, &orphaned).await?;
        tx.commit().await.map_err(backend)?;
        Ok(ids.len() as u64)
    }

    async fn get_instance(&self, id: InstanceId) -> Result<Option<JobInstance>> {
        self.fetch_instance("job_instance", id).await
    }

    async fn get_state(&self, id: InstanceId) -> Result<InstanceState> {
        let state: Option<String> =
            sqlx::query_scalar("SELECT state FROM job_instance WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        let state = match state {
            Some(state) => state,
            None => sqlx::query_scalar("SELECT state FROM job_history WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?
                .ok_or_else(|| Error::not_found("instance", id))?,
        };
        InstanceState::parse(&state)
            .ok_or_else(|| Error::BackendUnavailable(format!("bad state column: {state}")))
    }

    async fn get_history(&self, id: InstanceId) -> Result<Option<HistoryRecord>> {
        let sql = format!("SELECT {INSTANCE_COLUMNS}, archived_at FROM job_history WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let archived_at: DateTime<Utc> = row.get("archived_at");
        let instance_row = InstanceRow::from_row(&row).map_err(backend)?;
        let mut params = Self::load_parameters(&self.pool, &[id.0]).await?;
        let instance = instance_row.into_instance(params.remove(&id.0).unwrap_or_default())?;
        Ok(Some(HistoryRecord {
            instance,
            archived_at,
        }))
    }

    async fn list_instances(&self, filter: InstanceFilter) -> Result<Vec<JobInstance>> {
        let mut out = Vec::new();
        let tables: &[&str] = if filter.include_history {
            &["job_instance", "job_history"]
        } else {
            &["job_instance"]
        };
        for table in tables {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "SELECT {} FROM {table} ji JOIN job_def jd ON jd.id = ji.job_def_id WHERE TRUE",
                INSTANCE_COLUMNS
                    .split(", ")
                    .map(|c| format!("ji.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
            if let Some(app) = &filter.application_name {
                builder.push(" AND jd.application_name = ").push_bind(app);
            }
            if let Some(queue) = filter.queue {
                builder.push(" AND ji.queue_id = ").push_bind(queue.0);
            }
            if let Some(node) = filter.node {
                builder.push(" AND ji.attributed_node = ").push_bind(node.0);
            }
            if let Some(states) = &filter.states {
                let names: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();
                builder.push(" AND ji.state = ANY(").push_bind(names).push(")");
            }
            if let Some(user) = &filter.user {
                builder.push(" AND ji.username = ").push_bind(user);
            }
            builder.push(" ORDER BY ji.id");
            let rows = builder
                .build_query_as::<InstanceRow>()
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
            let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
            let mut params = Self::load_parameters(&self.pool, &ids).await?;
            for row in rows {
                let p = params.remove(&row.id).unwrap_or_default();
                out.push(row.into_instance(p)?);
            }
        }
        out.sort_by_key(|i| i.id);
        Ok(out)
    }

    async fn get_messages(&self, id: InstanceId) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT instance_id, body, created_at FROM message WHERE instance_id = $1 ORDER BY id",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows
            .into_iter()
            .map(|row| Message {
                instance: InstanceId(row.get("instance_id")),
                body: row.get("body"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn get_progress(&self, id: InstanceId) -> Result<Option<i32>> {
        let live: Option<Option<i32>> =
            sqlx::query_scalar("SELECT progress FROM job_instance WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        if let Some(progress) = live {
            return Ok(progress);
        }
        sqlx::query_scalar("SELECT progress FROM job_history WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| Error::not_found("instance", id))
    }

    async fn get_deliverables(&self, id: InstanceId) -> Result<Vec<Deliverable>> {
        let rows = sqlx::query("SELECT * FROM deliverable WHERE instance_id = $1 ORDER BY id")
            .bind(id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows.into_iter().map(deliverable_from_row).collect())
    }

    async fn get_deliverable(&self, id: DeliverableId) -> Result<Deliverable> {
        sqlx::query("SELECT * FROM deliverable WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(deliverable_from_row)
            .ok_or_else(|| Error::not_found("deliverable", id))
    }
}

async fn def_from_row(pool: &PgPool, row: PgRow) -> Result<JobDefinition> {
    let id: i64 = row.get("id");
    let params = sqlx::query("SELECT key, value FROM job_def_parameter WHERE job_def_id = $1")
        .bind(id)
        .fetch_all(pool)
        .await
        .map_err(backend)?
        .into_iter()
        .map(|r| (r.get("key"), r.get("value")))
        .collect();
    Ok(JobDefinition {
        id: JobDefId(id),
        application_name: row.get("application_name"),
        entry_point: row.get("entry_point"),
        artifact_path: row.get("artifact_path"),
        default_queue: QueueId(row.get("queue_id")),
        can_restart: row.get("can_restart"),
        highlander: row.get("highlander"),
        max_time_running_ms: row.get("max_time_running_ms"),
        default_parameters: params,
    })
}
