use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::models::*;
use super::{StoreError, StoreResult};

const REGISTRY_MIGRATION: &str = r#"
CREATE TABLE IF NOT EXISTS plans (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL UNIQUE,
    goal TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    meta TEXT NOT NULL,
    location TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);
"#;

const PLAN_MIGRATION: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    plan_id TEXT NOT NULL,
    parent_id TEXT,
    root_id TEXT NOT NULL,
    name TEXT NOT NULL,
    task_type TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL,
    depth INTEGER NOT NULL,
    position INTEGER NOT NULL,
    path TEXT NOT NULL,
    session_id TEXT,
    workflow_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS links (
    from_id TEXT NOT NULL,
    to_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    PRIMARY KEY (from_id, to_id, kind)
);
CREATE TABLE IF NOT EXISTS task_inputs (
    task_id TEXT PRIMARY KEY,
    content TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS task_outputs (
    task_id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS evaluations (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    iteration INTEGER NOT NULL,
    content_snapshot TEXT NOT NULL,
    overall_score REAL NOT NULL,
    dimension_scores TEXT NOT NULL,
    suggestions TEXT NOT NULL,
    needs_revision INTEGER NOT NULL,
    mode TEXT NOT NULL,
    created_at TEXT NOT NULL,
    meta TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS snapshots (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    label TEXT NOT NULL,
    combined_text TEXT NOT NULL,
    sections TEXT NOT NULL,
    meta TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(task_id, label)
);
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    plan_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    strategy TEXT NOT NULL,
    options TEXT NOT NULL,
    status TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);
"#;

/// Persists plans, tasks, links, outputs, evaluation history, and context
/// snapshots. One SQLite file per plan, keyed by a registry database.
#[derive(Clone)]
pub struct Store {
    data_dir: PathBuf,
    registry: SqlitePool,
    plan_pools: Arc<RwLock<HashMap<String, SqlitePool>>>,
}

impl Store {
    pub async fn open(data_dir: impl AsRef<Path>) -> StoreResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let registry_path = data_dir.join("registry.db");
        let registry = Self::open_pool(&registry_path).await?;
        sqlx::query(REGISTRY_MIGRATION).execute(&registry).await?;
        Ok(Self {
            data_dir,
            registry,
            plan_pools: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    async fn open_pool(path: &Path) -> StoreResult<SqlitePool> {
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await?;
        Ok(pool)
    }

    async fn plan_pool(&self, plan_id: &str) -> StoreResult<SqlitePool> {
        if let Some(pool) = self.plan_pools.read().await.get(plan_id) {
            return Ok(pool.clone());
        }
        let row = sqlx::query("SELECT location FROM plans WHERE id = ?1")
            .bind(plan_id)
            .fetch_optional(&self.registry)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("plan {plan_id}")))?;
        let location: String = row.get(0);
        let pool = Self::open_pool(Path::new(&location)).await?;
        sqlx::query(PLAN_MIGRATION).execute(&pool).await?;
        self.plan_pools
            .write()
            .await
            .insert(plan_id.to_string(), pool.clone());
        Ok(pool)
    }

    // ---------------------------------------------------------------
    // Plans
    // ---------------------------------------------------------------

    pub async fn create_plan(&self, title: String, goal: String) -> StoreResult<Plan> {
        let existing = sqlx::query("SELECT id FROM plans WHERE title = ?1")
            .bind(&title)
            .fetch_optional(&self.registry)
            .await?;
        if existing.is_some() {
            return Err(StoreError::Conflict(format!("plan title '{title}' already exists")));
        }

        let plan = Plan::new(title, goal);
        let location = self.data_dir.join(format!("plan-{}.db", plan.id));
        sqlx::query(
            "INSERT INTO plans (id, title, goal, created_at, updated_at, meta, location) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&plan.id)
        .bind(&plan.title)
        .bind(&plan.goal)
        .bind(plan.created_at.to_rfc3339())
        .bind(plan.updated_at.to_rfc3339())
        .bind(plan.meta.to_string())
        .bind(location.to_string_lossy().to_string())
        .execute(&self.registry)
        .await?;

        info!(plan_id = %plan.id, title = %plan.title, "created plan");
        let _ = self.plan_pool(&plan.id).await?;
        Ok(plan)
    }

    pub async fn get_plan(&self, id: &str) -> StoreResult<Plan> {
        let row = sqlx::query("SELECT id, title, goal, created_at, updated_at, meta FROM plans WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.registry)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("plan {id}")))?;
        Ok(plan_from_row(&row))
    }

    pub async fn list_plans(&self) -> StoreResult<Vec<Plan>> {
        let rows = sqlx::query("SELECT id, title, goal, created_at, updated_at, meta FROM plans ORDER BY created_at ASC")
            .fetch_all(&self.registry)
            .await?;
        Ok(rows.iter().map(plan_from_row).collect())
    }

    /// Cascades to all tasks, links, outputs, snapshots, evaluations of the plan.
    pub async fn delete_plan(&self, id: &str) -> StoreResult<()> {
        let row = sqlx::query("SELECT location FROM plans WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.registry)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("plan {id}")))?;
        let location: String = row.get(0);

        self.plan_pools.write().await.remove(id);
        sqlx::query("DELETE FROM plans WHERE id = ?1")
            .bind(id)
            .execute(&self.registry)
            .await?;
        let _ = std::fs::remove_file(&location);
        info!(plan_id = %id, "deleted plan");
        Ok(())
    }

    // ---------------------------------------------------------------
    // Tasks
    // ---------------------------------------------------------------

    /// Creates a task under `parent_id` (None for a root task). Assigns
    /// `depth`, `root_id`, and `path` per §4.1.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_task(
        &self,
        plan_id: &str,
        parent: Option<&Task>,
        name: String,
        task_type: TaskType,
        priority: i64,
        position: Option<i64>,
    ) -> StoreResult<Task> {
        let pool = self.plan_pool(plan_id).await?;
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        let (depth, root_id, parent_path, parent_id) = match parent {
            Some(p) => (p.depth + 1, p.root_id.clone(), p.path.clone(), Some(p.id.clone())),
            None => (0, id.clone(), String::new(), None),
        };

        if depth > MAX_DEPTH {
            return Err(StoreError::Conflict(format!("depth {depth} exceeds MAX_DEPTH {MAX_DEPTH}")));
        }
        if task_type == TaskType::Root && parent_id.is_some() {
            return Err(StoreError::Conflict("root task must not have a parent".into()));
        }
        if task_type != TaskType::Root && parent_id.is_none() {
            return Err(StoreError::Conflict("non-root task must have a parent".into()));
        }

        let position = match position {
            Some(p) => p,
            None => {
                let row = sqlx::query(
                    "SELECT COALESCE(MAX(position), -1) FROM tasks WHERE plan_id = ?1 AND (parent_id = ?2 OR (parent_id IS NULL AND ?2 IS NULL))",
                )
                .bind(plan_id)
                .bind(parent_id.as_deref())
                .fetch_one(&pool)
                .await?;
                let max: i64 = row.get(0);
                max + 1
            }
        };

        let path = if parent_path.is_empty() {
            format!("{position}")
        } else {
            format!("{parent_path}/{position}")
        };

        let task = Task {
            id,
            plan_id: plan_id.to_string(),
            parent_id,
            root_id,
            name,
            task_type,
            status: TaskStatus::Pending,
            priority,
            depth,
            position,
            path,
            session_id: None,
            workflow_id: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO tasks (id, plan_id, parent_id, root_id, name, task_type, status, priority, depth, position, path, session_id, workflow_id, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
        )
        .bind(&task.id)
        .bind(&task.plan_id)
        .bind(&task.parent_id)
        .bind(&task.root_id)
        .bind(&task.name)
        .bind(task_type_str(task.task_type))
        .bind(task_status_str(task.status))
        .bind(task.priority)
        .bind(task.depth)
        .bind(task.position)
        .bind(&task.path)
        .bind(&task.session_id)
        .bind(&task.workflow_id)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&pool)
        .await?;

        debug!(task_id = %task.id, depth = task.depth, "created task");
        Ok(task)
    }

    pub async fn get_task(&self, plan_id: &str, task_id: &str) -> StoreResult<Task> {
        let pool = self.plan_pool(plan_id).await?;
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(task_id)
            .fetch_optional(&pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;
        Ok(task_from_row(&row))
    }

    pub async fn update_status(&self, plan_id: &str, task_id: &str, status: TaskStatus) -> StoreResult<()> {
        let pool = self.plan_pool(plan_id).await?;
        sqlx::query("UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(task_status_str(status))
            .bind(Utc::now().to_rfc3339())
            .bind(task_id)
            .execute(&pool)
            .await?;
        Ok(())
    }

    /// Rewrites `depth`, `root_id`, `path` transitively for the moved
    /// subtree; rejects moves that would create a cycle.
    pub async fn move_task(&self, plan_id: &str, task_id: &str, new_parent_id: &str, position: i64) -> StoreResult<()> {
        let pool = self.plan_pool(plan_id).await?;
        let task = self.get_task(plan_id, task_id).await?;
        let new_parent = self.get_task(plan_id, new_parent_id).await?;

        let mut ancestor = Some(new_parent.clone());
        while let Some(a) = ancestor {
            if a.id == task.id {
                return Err(StoreError::Conflict("move would create a cycle".into()));
            }
            ancestor = match &a.parent_id {
                Some(pid) => Some(self.get_task(plan_id, pid).await?),
                None => None,
            };
        }

        let depth_delta = (new_parent.depth + 1) - task.depth;
        let new_path = format!("{}/{}", new_parent.path, position);
        let old_path_prefix = task.path.clone();

        let subtree = self.subtree(plan_id, task_id).await?;
        for t in &subtree {
            let new_depth = t.depth + depth_delta;
            if new_depth > MAX_DEPTH {
                return Err(StoreError::Conflict(format!("move would exceed MAX_DEPTH {MAX_DEPTH}")));
            }
            let rewritten_path = if t.id == task.id {
                new_path.clone()
            } else {
                t.path.replacen(&old_path_prefix, &new_path, 1)
            };
            sqlx::query("UPDATE tasks SET depth = ?1, root_id = ?2, path = ?3, updated_at = ?4 WHERE id = ?5")
                .bind(new_depth)
                .bind(&new_parent.root_id)
                .bind(&rewritten_path)
                .bind(Utc::now().to_rfc3339())
                .bind(&t.id)
                .execute(&pool)
                .await?;
        }

        sqlx::query("UPDATE tasks SET parent_id = ?1, position = ?2 WHERE id = ?3")
            .bind(new_parent_id)
            .bind(position)
            .bind(task_id)
            .execute(&pool)
            .await?;
        Ok(())
    }

    /// Cascades to descendants and incident links.
    pub async fn delete_task(&self, plan_id: &str, task_id: &str) -> StoreResult<()> {
        let pool = self.plan_pool(plan_id).await?;
        let subtree = self.subtree(plan_id, task_id).await?;
        let ids: Vec<String> = subtree.iter().map(|t| t.id.clone()).collect();
        for id in &ids {
            sqlx::query("DELETE FROM links WHERE from_id = ?1 OR to_id = ?1").bind(id).execute(&pool).await?;
            sqlx::query("DELETE FROM task_inputs WHERE task_id = ?1").bind(id).execute(&pool).await?;
            sqlx::query("DELETE FROM task_outputs WHERE task_id = ?1").bind(id).execute(&pool).await?;
            sqlx::query("DELETE FROM evaluations WHERE task_id = ?1").bind(id).execute(&pool).await?;
            sqlx::query("DELETE FROM snapshots WHERE task_id = ?1").bind(id).execute(&pool).await?;
            sqlx::query("DELETE FROM tasks WHERE id = ?1").bind(id).execute(&pool).await?;
        }
        Ok(())
    }

    pub async fn children(&self, plan_id: &str, task_id: &str) -> StoreResult<Vec<Task>> {
        let pool = self.plan_pool(plan_id).await?;
        let rows = sqlx::query("SELECT * FROM tasks WHERE parent_id = ?1 ORDER BY position ASC")
            .bind(task_id)
            .fetch_all(&pool)
            .await?;
        Ok(rows.iter().map(task_from_row).collect())
    }

    pub async fn siblings(&self, plan_id: &str, task_id: &str) -> StoreResult<Vec<Task>> {
        let task = self.get_task(plan_id, task_id).await?;
        match &task.parent_id {
            None => Ok(Vec::new()),
            Some(parent_id) => {
                let mut kids = self.children(plan_id, parent_id).await?;
                kids.retain(|t| t.id != task.id);
                Ok(kids)
            }
        }
    }

    pub async fn subtree(&self, plan_id: &str, task_id: &str) -> StoreResult<Vec<Task>> {
        let pool = self.plan_pool(plan_id).await?;
        let task = self.get_task(plan_id, task_id).await?;
        let like_pattern = format!("{}/%", task.path);
        let rows = sqlx::query("SELECT * FROM tasks WHERE id = ?1 OR path LIKE ?2 ORDER BY depth ASC, position ASC")
            .bind(task_id)
            .bind(&like_pattern)
            .fetch_all(&pool)
            .await?;
        Ok(rows.iter().map(task_from_row).collect())
    }

    pub async fn root_of(&self, plan_id: &str, task_id: &str) -> StoreResult<Task> {
        let task = self.get_task(plan_id, task_id).await?;
        self.get_task(plan_id, &task.root_id).await
    }

    pub async fn plan_tasks(&self, plan_id: &str) -> StoreResult<Vec<Task>> {
        let pool = self.plan_pool(plan_id).await?;
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY depth ASC, position ASC")
            .fetch_all(&pool)
            .await?;
        Ok(rows.iter().map(task_from_row).collect())
    }

    // ---------------------------------------------------------------
    // Links
    // ---------------------------------------------------------------

    pub async fn create_link(&self, plan_id: &str, from_id: &str, to_id: &str, kind: LinkKind) -> StoreResult<()> {
        if from_id == to_id {
            return Err(StoreError::Conflict("a link cannot point a task to itself".into()));
        }
        let pool = self.plan_pool(plan_id).await?;

        if kind == LinkKind::Requires {
            // Cheap cycle guard: reject if `to_id` can already reach `from_id` via `requires`.
            if self.requires_reaches(plan_id, to_id, from_id).await? {
                return Err(StoreError::Conflict("link would create a requires cycle".into()));
            }
        }

        sqlx::query("INSERT OR IGNORE INTO links (from_id, to_id, kind) VALUES (?1, ?2, ?3)")
            .bind(from_id)
            .bind(to_id)
            .bind(link_kind_str(kind))
            .execute(&pool)
            .await?;
        Ok(())
    }

    pub async fn delete_link(&self, plan_id: &str, from_id: &str, to_id: &str, kind: LinkKind) -> StoreResult<()> {
        let pool = self.plan_pool(plan_id).await?;
        sqlx::query("DELETE FROM links WHERE from_id = ?1 AND to_id = ?2 AND kind = ?3")
            .bind(from_id)
            .bind(to_id)
            .bind(link_kind_str(kind))
            .execute(&pool)
            .await?;
        Ok(())
    }

    /// Upstream tasks ordered `requires` before `refers`, then priority asc,
    /// then id asc — a public contract the Context Assembler relies on.
    pub async fn list_dependencies(&self, plan_id: &str, task_id: &str) -> StoreResult<Vec<(Task, LinkKind)>> {
        let pool = self.plan_pool(plan_id).await?;
        let rows = sqlx::query("SELECT to_id, kind FROM links WHERE from_id = ?1 AND kind IN ('requires', 'refers')")
            .bind(task_id)
            .fetch_all(&pool)
            .await?;

        let mut deps = Vec::new();
        for row in &rows {
            let to_id: String = row.get(0);
            let kind_str: String = row.get(1);
            let kind = link_kind_from_str(&kind_str);
            if let Ok(task) = self.get_task(plan_id, &to_id).await {
                deps.push((task, kind));
            }
        }
        deps.sort_by(|(ta, ka), (tb, kb)| {
            let kind_rank = |k: &LinkKind| if *k == LinkKind::Requires { 0 } else { 1 };
            kind_rank(ka)
                .cmp(&kind_rank(kb))
                .then(ta.priority.cmp(&tb.priority))
                .then(ta.id.cmp(&tb.id))
        });
        Ok(deps)
    }

    pub async fn inbound_links(&self, plan_id: &str, task_id: &str) -> StoreResult<Vec<TaskLink>> {
        let pool = self.plan_pool(plan_id).await?;
        let rows = sqlx::query("SELECT from_id, to_id, kind FROM links WHERE to_id = ?1")
            .bind(task_id)
            .fetch_all(&pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| TaskLink {
                from_id: r.get(0),
                to_id: r.get(1),
                kind: link_kind_from_str(&r.get::<String, _>(2)),
            })
            .collect())
    }

    pub async fn outbound_links(&self, plan_id: &str, task_id: &str) -> StoreResult<Vec<TaskLink>> {
        let pool = self.plan_pool(plan_id).await?;
        let rows = sqlx::query("SELECT from_id, to_id, kind FROM links WHERE from_id = ?1")
            .bind(task_id)
            .fetch_all(&pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| TaskLink {
                from_id: r.get(0),
                to_id: r.get(1),
                kind: link_kind_from_str(&r.get::<String, _>(2)),
            })
            .collect())
    }

    pub async fn all_requires_edges(&self, plan_id: &str) -> StoreResult<Vec<(String, String)>> {
        let pool = self.plan_pool(plan_id).await?;
        let rows = sqlx::query("SELECT from_id, to_id FROM links WHERE kind = 'requires'")
            .fetch_all(&pool)
            .await?;
        Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
    }

    async fn requires_reaches(&self, plan_id: &str, from: &str, target: &str) -> StoreResult<bool> {
        let edges = self.all_requires_edges(plan_id).await?;
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for (a, b) in &edges {
            adjacency.entry(a.as_str()).or_default().push(b.as_str());
        }
        let mut stack = vec![from];
        let mut seen = std::collections::HashSet::new();
        while let Some(node) = stack.pop() {
            if node == target {
                return Ok(true);
            }
            if !seen.insert(node) {
                continue;
            }
            if let Some(next) = adjacency.get(node) {
                stack.extend(next.iter().copied());
            }
        }
        Ok(false)
    }

    // ---------------------------------------------------------------
    // Outputs
    // ---------------------------------------------------------------

    pub async fn put_output(&self, plan_id: &str, task_id: &str, content: &str) -> StoreResult<()> {
        let pool = self.plan_pool(plan_id).await?;
        sqlx::query(
            "INSERT INTO task_outputs (task_id, content, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(task_id) DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at",
        )
        .bind(task_id)
        .bind(content)
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await?;
        Ok(())
    }

    pub async fn get_output(&self, plan_id: &str, task_id: &str) -> StoreResult<Option<TaskOutput>> {
        let pool = self.plan_pool(plan_id).await?;
        let row = sqlx::query("SELECT task_id, content, updated_at FROM task_outputs WHERE task_id = ?1")
            .bind(task_id)
            .fetch_optional(&pool)
            .await?;
        Ok(row.map(|r| TaskOutput {
            task_id: r.get(0),
            content: r.get(1),
            updated_at: parse_dt(&r.get::<String, _>(2)),
        }))
    }

    pub async fn put_input(&self, plan_id: &str, task_id: &str, content: &str) -> StoreResult<()> {
        let pool = self.plan_pool(plan_id).await?;
        sqlx::query(
            "INSERT INTO task_inputs (task_id, content) VALUES (?1, ?2)
             ON CONFLICT(task_id) DO UPDATE SET content = excluded.content",
        )
        .bind(task_id)
        .bind(content)
        .execute(&pool)
        .await?;
        Ok(())
    }

    pub async fn get_input(&self, plan_id: &str, task_id: &str) -> StoreResult<Option<String>> {
        let pool = self.plan_pool(plan_id).await?;
        let row = sqlx::query("SELECT content FROM task_inputs WHERE task_id = ?1")
            .bind(task_id)
            .fetch_optional(&pool)
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    // ---------------------------------------------------------------
    // Evaluations (append-only)
    // ---------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn append_evaluation(&self, plan_id: &str, record: &EvaluationRecord) -> StoreResult<()> {
        let pool = self.plan_pool(plan_id).await?;
        sqlx::query(
            "INSERT INTO evaluations (id, task_id, iteration, content_snapshot, overall_score, dimension_scores, suggestions, needs_revision, mode, created_at, meta)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
        )
        .bind(&record.id)
        .bind(&record.task_id)
        .bind(record.iteration)
        .bind(&record.content_snapshot)
        .bind(record.overall_score)
        .bind(serde_json::to_string(&record.dimension_scores).unwrap_or_default())
        .bind(serde_json::to_string(&record.suggestions).unwrap_or_default())
        .bind(record.needs_revision as i64)
        .bind(evaluation_mode_str(record.mode))
        .bind(record.created_at.to_rfc3339())
        .bind(record.meta.to_string())
        .execute(&pool)
        .await?;
        Ok(())
    }

    pub async fn list_evaluations(&self, plan_id: &str, task_id: &str) -> StoreResult<Vec<EvaluationRecord>> {
        let pool = self.plan_pool(plan_id).await?;
        let rows = sqlx::query("SELECT * FROM evaluations WHERE task_id = ?1 ORDER BY iteration ASC")
            .bind(task_id)
            .fetch_all(&pool)
            .await?;
        Ok(rows.iter().map(evaluation_from_row).collect())
    }

    // ---------------------------------------------------------------
    // Snapshots (append-only, idempotent per (task, label))
    // ---------------------------------------------------------------

    pub async fn save_snapshot(
        &self,
        plan_id: &str,
        task_id: &str,
        label: &str,
        combined: &str,
        sections: &[SectionMeta],
        meta: serde_json::Value,
    ) -> StoreResult<ContextSnapshot> {
        let pool = self.plan_pool(plan_id).await?;
        let snapshot = ContextSnapshot {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            label: label.to_string(),
            combined_text: combined.to_string(),
            sections: sections.to_vec(),
            meta,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO snapshots (id, task_id, label, combined_text, sections, meta, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(task_id, label) DO UPDATE SET
                combined_text = excluded.combined_text,
                sections = excluded.sections,
                meta = excluded.meta,
                created_at = excluded.created_at",
        )
        .bind(&snapshot.id)
        .bind(&snapshot.task_id)
        .bind(&snapshot.label)
        .bind(&snapshot.combined_text)
        .bind(serde_json::to_string(&snapshot.sections).unwrap_or_default())
        .bind(snapshot.meta.to_string())
        .bind(snapshot.created_at.to_rfc3339())
        .execute(&pool)
        .await?;
        Ok(snapshot)
    }

    pub async fn list_snapshots(&self, plan_id: &str, task_id: &str) -> StoreResult<Vec<ContextSnapshot>> {
        let pool = self.plan_pool(plan_id).await?;
        let rows = sqlx::query("SELECT * FROM snapshots WHERE task_id = ?1 ORDER BY created_at ASC")
            .bind(task_id)
            .fetch_all(&pool)
            .await?;
        Ok(rows.iter().map(snapshot_from_row).collect())
    }

    pub async fn get_snapshot(&self, plan_id: &str, task_id: &str, label: &str) -> StoreResult<ContextSnapshot> {
        let pool = self.plan_pool(plan_id).await?;
        let row = sqlx::query("SELECT * FROM snapshots WHERE task_id = ?1 AND label = ?2")
            .bind(task_id)
            .bind(label)
            .fetch_optional(&pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("snapshot {task_id}/{label}")))?;
        Ok(snapshot_from_row(&row))
    }

    // ---------------------------------------------------------------
    // Runs
    // ---------------------------------------------------------------

    pub async fn create_run(&self, plan_id: &str, strategy: &str, options: serde_json::Value) -> StoreResult<Run> {
        let pool = self.plan_pool(plan_id).await?;
        let run = Run {
            id: Uuid::new_v4().to_string(),
            plan_id: plan_id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            strategy: strategy.to_string(),
            options,
            status: RunStatus::Running,
        };
        sqlx::query(
            "INSERT INTO runs (id, plan_id, started_at, finished_at, strategy, options, status) VALUES (?1,?2,?3,?4,?5,?6,?7)",
        )
        .bind(&run.id)
        .bind(&run.plan_id)
        .bind(run.started_at.to_rfc3339())
        .bind(run.finished_at.map(|d| d.to_rfc3339()))
        .bind(&run.strategy)
        .bind(run.options.to_string())
        .bind(run_status_str(run.status))
        .execute(&pool)
        .await?;
        Ok(run)
    }

    pub async fn finish_run(&self, plan_id: &str, run_id: &str, status: RunStatus) -> StoreResult<()> {
        let pool = self.plan_pool(plan_id).await?;
        sqlx::query("UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3")
            .bind(run_status_str(status))
            .bind(Utc::now().to_rfc3339())
            .bind(run_id)
            .execute(&pool)
            .await?;
        Ok(())
    }
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

fn task_type_str(t: TaskType) -> &'static str {
    match t {
        TaskType::Root => "root",
        TaskType::Composite => "composite",
        TaskType::Atomic => "atomic",
    }
}

fn task_type_from_str(s: &str) -> TaskType {
    match s {
        "root" => TaskType::Root,
        "composite" => TaskType::Composite,
        _ => TaskType::Atomic,
    }
}

fn task_status_str(s: TaskStatus) -> &'static str {
    match s {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}

fn task_status_from_str(s: &str) -> TaskStatus {
    match s {
        "running" => TaskStatus::Running,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        "cancelled" => TaskStatus::Cancelled,
        _ => TaskStatus::Pending,
    }
}

fn link_kind_str(k: LinkKind) -> &'static str {
    match k {
        LinkKind::Requires => "requires",
        LinkKind::Refers => "refers",
        LinkKind::Duplicates => "duplicates",
        LinkKind::RelatesTo => "relates_to",
    }
}

fn link_kind_from_str(s: &str) -> LinkKind {
    match s {
        "requires" => LinkKind::Requires,
        "refers" => LinkKind::Refers,
        "duplicates" => LinkKind::Duplicates,
        _ => LinkKind::RelatesTo,
    }
}

fn evaluation_mode_str(m: EvaluationMode) -> &'static str {
    match m {
        EvaluationMode::SingleJudge => "single_judge",
        EvaluationMode::MultiExpert => "multi_expert",
        EvaluationMode::Adversarial => "adversarial",
    }
}

fn evaluation_mode_from_str(s: &str) -> EvaluationMode {
    match s {
        "multi_expert" => EvaluationMode::MultiExpert,
        "adversarial" => EvaluationMode::Adversarial,
        _ => EvaluationMode::SingleJudge,
    }
}

fn run_status_str(s: RunStatus) -> &'static str {
    match s {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Cancelled => "cancelled",
        RunStatus::Failed => "failed",
    }
}

fn plan_from_row(row: &sqlx::sqlite::SqliteRow) -> Plan {
    Plan {
        id: row.get(0),
        title: row.get(1),
        goal: row.get(2),
        created_at: parse_dt(&row.get::<String, _>(3)),
        updated_at: parse_dt(&row.get::<String, _>(4)),
        meta: serde_json::from_str(&row.get::<String, _>(5)).unwrap_or(serde_json::Value::Null),
    }
}

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Task {
    Task {
        id: row.get("id"),
        plan_id: row.get("plan_id"),
        parent_id: row.get("parent_id"),
        root_id: row.get("root_id"),
        name: row.get("name"),
        task_type: task_type_from_str(&row.get::<String, _>("task_type")),
        status: task_status_from_str(&row.get::<String, _>("status")),
        priority: row.get("priority"),
        depth: row.get("depth"),
        position: row.get("position"),
        path: row.get("path"),
        session_id: row.get("session_id"),
        workflow_id: row.get("workflow_id"),
        created_at: parse_dt(&row.get::<String, _>("created_at")),
        updated_at: parse_dt(&row.get::<String, _>("updated_at")),
    }
}

fn evaluation_from_row(row: &sqlx::sqlite::SqliteRow) -> EvaluationRecord {
    EvaluationRecord {
        id: row.get("id"),
        task_id: row.get("task_id"),
        iteration: row.get::<i64, _>("iteration") as u32,
        content_snapshot: row.get("content_snapshot"),
        overall_score: row.get("overall_score"),
        dimension_scores: serde_json::from_str(&row.get::<String, _>("dimension_scores")).unwrap_or_default(),
        suggestions: serde_json::from_str(&row.get::<String, _>("suggestions")).unwrap_or_default(),
        needs_revision: row.get::<i64, _>("needs_revision") != 0,
        mode: evaluation_mode_from_str(&row.get::<String, _>("mode")),
        created_at: parse_dt(&row.get::<String, _>("created_at")),
        meta: serde_json::from_str(&row.get::<String, _>("meta")).unwrap_or(serde_json::Value::Null),
    }
}

fn snapshot_from_row(row: &sqlx::sqlite::SqliteRow) -> ContextSnapshot {
    ContextSnapshot {
        id: row.get("id"),
        task_id: row.get("task_id"),
        label: row.get("label"),
        combined_text: row.get("combined_text"),
        sections: serde_json::from_str(&row.get::<String, _>("sections")).unwrap_or_default(),
        meta: serde_json::from_str(&row.get::<String, _>("meta")).unwrap_or(serde_json::Value::Null),
        created_at: parse_dt(&row.get::<String, _>("created_at")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_root_task_with_depth_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let plan = store.create_plan("t1".into(), "goal".into()).await.unwrap();
        let root = store
            .create_task(&plan.id, None, "root".into(), TaskType::Root, 0, None)
            .await
            .unwrap();
        assert_eq!(root.depth, 0);
        assert_eq!(root.root_id, root.id);
    }

    #[tokio::test]
    async fn child_inherits_root_and_increments_depth() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let plan = store.create_plan("t2".into(), "goal".into()).await.unwrap();
        let root = store
            .create_task(&plan.id, None, "root".into(), TaskType::Root, 0, None)
            .await
            .unwrap();
        let child = store
            .create_task(&plan.id, Some(&root), "child".into(), TaskType::Composite, 0, None)
            .await
            .unwrap();
        assert_eq!(child.depth, 1);
        assert_eq!(child.root_id, root.id);
    }

    #[tokio::test]
    async fn rejects_duplicate_plan_titles() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        store.create_plan("dup".into(), "goal".into()).await.unwrap();
        let err = store.create_plan("dup".into(), "goal2".into()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn rejects_requires_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let plan = store.create_plan("cyc".into(), "goal".into()).await.unwrap();
        let root = store.create_task(&plan.id, None, "root".into(), TaskType::Root, 0, None).await.unwrap();
        let a = store.create_task(&plan.id, Some(&root), "a".into(), TaskType::Atomic, 0, None).await.unwrap();
        let b = store.create_task(&plan.id, Some(&root), "b".into(), TaskType::Atomic, 0, None).await.unwrap();
        store.create_link(&plan.id, &a.id, &b.id, LinkKind::Requires).await.unwrap();
        let err = store.create_link(&plan.id, &b.id, &a.id, LinkKind::Requires).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_task_cascades_to_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let plan = store.create_plan("casc".into(), "goal".into()).await.unwrap();
        let root = store.create_task(&plan.id, None, "root".into(), TaskType::Root, 0, None).await.unwrap();
        let child = store
            .create_task(&plan.id, Some(&root), "child".into(), TaskType::Composite, 0, None)
            .await
            .unwrap();
        let grandchild = store
            .create_task(&plan.id, Some(&child), "gc".into(), TaskType::Atomic, 0, None)
            .await
            .unwrap();
        store.delete_task(&plan.id, &child.id).await.unwrap();
        assert!(store.get_task(&plan.id, &grandchild.id).await.is_err());
    }
}
