//! Repository Pattern for server storage
//!
//! The run controller only talks to [`ServerRepository`], which keeps the
//! pipeline independent of where groups, servers and measurements live:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        RunController / ConcurrentProber / Ranker            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ServerRepository trait                    │
//! └─────────────────────────────────────────────────────────────┘
//!                  │                           │
//!                  ▼                           ▼
//!         ┌─────────────────┐         ┌─────────────────┐
//!         │     SQLite      │         │    In-memory    │
//!         └─────────────────┘         └─────────────────┘
//! ```
//!
//! Every write touches a single key (or a single group's ordering) and is
//! applied under one lock, so concurrent probe tasks never corrupt each
//! other's records. Measurements are keyed by server id and are *not*
//! removed together with their server; readers treat stale entries as
//! absent.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::{AffiliationInfo, Group, Outbound, SelectedServer, ServerConfig, ServerEntry};
use crate::utils::error::StorageError;

// ============================================================================
// Repository Trait
// ============================================================================

/// Persistent store for groups, servers, measurements and the selection
#[async_trait]
pub trait ServerRepository: Send + Sync {
    /// All groups in creation order
    async fn list_groups(&self) -> Result<Vec<Group>>;

    /// Get a group by id
    async fn get_group(&self, id: &str) -> Result<Option<Group>>;

    /// Insert or update a group
    async fn save_group(&self, group: &Group) -> Result<()>;

    /// Server ids of a group in stored order
    async fn list_server_ids(&self, group_id: &str) -> Result<Vec<String>>;

    /// Server ids of every group in stored order
    async fn list_all_server_ids(&self) -> Result<Vec<String>>;

    /// Get a server by id
    async fn get_config(&self, id: &str) -> Result<Option<ServerConfig>>;

    /// Append a server at the end of the stored order
    async fn add_server(&self, config: &ServerConfig) -> Result<()>;

    /// Replace every server of a group with `configs`, keeping their order.
    ///
    /// Returns the ids of the stored servers.
    async fn replace_group_servers(
        &self,
        group_id: &str,
        configs: Vec<ServerConfig>,
    ) -> Result<Vec<String>>;

    /// Remove a server; unknown ids are ignored.
    ///
    /// Removing the selected server clears the selection, as does
    /// [`replace_group_servers`](Self::replace_group_servers) when the selected
    /// server is not among the new ones.
    async fn remove_server(&self, id: &str) -> Result<()>;

    /// Store a new order for the servers of a group.
    ///
    /// Ids that do not belong to the group are ignored; members missing from
    /// `ids` keep their relative order after the listed ones.
    async fn set_server_order(&self, group_id: &str, ids: &[String]) -> Result<()>;

    /// Last measurement of a server
    async fn get_affiliation(&self, id: &str) -> Result<Option<AffiliationInfo>>;

    /// Overwrite the measurement of a server
    async fn set_affiliation(&self, id: &str, info: &AffiliationInfo) -> Result<()>;

    /// Drop measurements for exactly `ids`
    async fn clear_affiliations(&self, ids: &[String]) -> Result<()>;

    /// Currently selected server
    async fn get_selected(&self) -> Result<Option<SelectedServer>>;

    /// Replace the selected server
    async fn set_selected(&self, selected: &SelectedServer) -> Result<()>;

    /// Servers of a group in stored order, skipping dangling ids
    async fn list_group_configs(&self, group_id: &str) -> Result<Vec<ServerConfig>> {
        let ids = self.list_server_ids(group_id).await?;
        let mut configs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(config) = self.get_config(&id).await? {
                configs.push(config);
            }
        }
        Ok(configs)
    }

    /// Every server joined with its measurement, in stored order
    async fn list_entries(&self) -> Result<Vec<ServerEntry>> {
        let ids = self.list_all_server_ids().await?;
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(config) = self.get_config(&id).await? else {
                continue;
            };
            let affiliation = self.get_affiliation(&id).await?;
            entries.push(ServerEntry {
                config,
                affiliation,
            });
        }
        Ok(entries)
    }
}

/// Compute the new member order of a group.
///
/// `members` is the group's current order. The result lists the requested ids
/// that are members (first occurrence wins) followed by the remaining members.
pub(crate) fn merge_order(members: &[String], requested: &[String]) -> Vec<String> {
    let member_set: HashSet<&str> = members.iter().map(String::as_str).collect();
    let mut seen: HashSet<&str> = HashSet::with_capacity(members.len());
    let mut order = Vec::with_capacity(members.len());

    for id in requested {
        if member_set.contains(id.as_str()) && seen.insert(id.as_str()) {
            order.push(id.clone());
        }
    }
    for id in members {
        if seen.insert(id.as_str()) {
            order.push(id.clone());
        }
    }

    order
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite implementation of ServerRepository
///
/// Uses `Mutex` to ensure thread-safety for the SQLite connection.
pub struct SqliteServerRepository {
    conn: Mutex<Connection>,
}

impl SqliteServerRepository {
    /// Open (or create) a repository at `path`
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.create_schema()?;

        tracing::info!(path = %path.display(), "SQLite repository initialized");
        Ok(repo)
    }

    /// Create in-memory repository (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.create_schema()?;
        Ok(repo)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        Ok(self.conn.lock().map_err(|_| StorageError::Poisoned)?)
    }

    fn create_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS groups (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    url TEXT NOT NULL DEFAULT '',
                    enabled INTEGER NOT NULL DEFAULT 1,
                    position INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS servers (
                    id TEXT PRIMARY KEY,
                    group_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    protocol TEXT NOT NULL,
                    params TEXT NOT NULL,
                    position INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_servers_group
                    ON servers(group_id, position);

                CREATE TABLE IF NOT EXISTS affiliations (
                    server_id TEXT PRIMARY KEY,
                    latency_ms INTEGER NOT NULL,
                    tested_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS selection (
                    slot INTEGER PRIMARY KEY CHECK (slot = 0),
                    group_id TEXT NOT NULL,
                    server_id TEXT NOT NULL
                );
                "#,
        )?;

        Ok(())
    }

    fn next_server_position(conn: &Connection) -> Result<i64> {
        let position: i64 = conn.query_row(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM servers",
            [],
            |row| row.get(0),
        )?;
        Ok(position)
    }

    fn drop_dangling_selection(conn: &Connection) -> Result<()> {
        conn.execute(
            "DELETE FROM selection WHERE server_id NOT IN (SELECT id FROM servers)",
            [],
        )?;
        Ok(())
    }

    fn insert_server(conn: &Connection, config: &ServerConfig, position: i64) -> Result<()> {
        let params_json = serde_json::to_string(&config.outbound.params)?;
        conn.execute(
            r#"
                INSERT OR REPLACE INTO servers (id, group_id, name, protocol, params, position)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            params![
                config.id,
                config.group_id,
                config.name,
                config.outbound.protocol,
                params_json,
                position
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl ServerRepository for SqliteServerRepository {
    async fn list_groups(&self) -> Result<Vec<Group>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, name, url, enabled FROM groups ORDER BY position, rowid")?;
        let groups = stmt
            .query_map([], |row| {
                Ok(Group {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    url: row.get(2)?,
                    enabled: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    async fn get_group(&self, id: &str) -> Result<Option<Group>> {
        let conn = self.lock()?;
        let group = conn
            .query_row(
                "SELECT id, name, url, enabled FROM groups WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Group {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        url: row.get(2)?,
                        enabled: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(group)
    }

    async fn save_group(&self, group: &Group) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
                INSERT INTO groups (id, name, url, enabled, position)
                VALUES (?1, ?2, ?3, ?4, (SELECT COALESCE(MAX(position), -1) + 1 FROM groups))
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    url = excluded.url,
                    enabled = excluded.enabled
                "#,
            params![group.id, group.name, group.url, group.enabled],
        )?;
        Ok(())
    }

    async fn list_server_ids(&self, group_id: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id FROM servers WHERE group_id = ?1 ORDER BY position, rowid")?;
        let ids = stmt
            .query_map(params![group_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    async fn list_all_server_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id FROM servers ORDER BY position, rowid")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    async fn get_config(&self, id: &str) -> Result<Option<ServerConfig>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, group_id, name, protocol, params FROM servers WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, group_id, name, protocol, params_json)) = row else {
            return Ok(None);
        };

        Ok(Some(ServerConfig {
            id,
            group_id,
            name,
            outbound: Outbound::new(protocol, serde_json::from_str(&params_json)?),
        }))
    }

    async fn add_server(&self, config: &ServerConfig) -> Result<()> {
        let conn = self.lock()?;
        let position = Self::next_server_position(&conn)?;
        Self::insert_server(&conn, config, position)
    }

    async fn replace_group_servers(
        &self,
        group_id: &str,
        configs: Vec<ServerConfig>,
    ) -> Result<Vec<String>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM servers WHERE group_id = ?1", params![group_id])?;

        let mut position = Self::next_server_position(&tx)?;
        let mut ids = Vec::with_capacity(configs.len());
        for mut config in configs {
            config.group_id = group_id.to_string();
            Self::insert_server(&tx, &config, position)?;
            ids.push(config.id);
            position += 1;
        }
        Self::drop_dangling_selection(&tx)?;

        tx.commit()?;
        Ok(ids)
    }

    async fn remove_server(&self, id: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM servers WHERE id = ?1", params![id])?;
        Self::drop_dangling_selection(&tx)?;
        tx.commit()?;
        Ok(())
    }

    async fn set_server_order(&self, group_id: &str, ids: &[String]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let current: Vec<(String, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT id, position FROM servers WHERE group_id = ?1 ORDER BY position, rowid",
            )?;
            let rows = stmt
                .query_map(params![group_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let members: Vec<String> = current.iter().map(|(id, _)| id.clone()).collect();
        let order = merge_order(&members, ids);

        // Reuse the group's own slots so other groups keep their positions
        for (id, (_, slot)) in order.iter().zip(current.iter()) {
            tx.execute(
                "UPDATE servers SET position = ?1 WHERE id = ?2",
                params![slot, id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    async fn get_affiliation(&self, id: &str) -> Result<Option<AffiliationInfo>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT latency_ms, tested_at FROM affiliations WHERE server_id = ?1",
                params![id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        Ok(row.map(|(latency_ms, tested_at)| AffiliationInfo {
            latency_ms,
            tested_at: DateTime::parse_from_rfc3339(&tested_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        }))
    }

    async fn set_affiliation(&self, id: &str, info: &AffiliationInfo) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
                INSERT INTO affiliations (server_id, latency_ms, tested_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(server_id) DO UPDATE SET
                    latency_ms = excluded.latency_ms,
                    tested_at = excluded.tested_at
                "#,
            params![id, info.latency_ms, info.tested_at.to_rfc3339()],
        )?;
        Ok(())
    }

    async fn clear_affiliations(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM affiliations WHERE server_id = ?1")?;
            for id in ids {
                stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_selected(&self) -> Result<Option<SelectedServer>> {
        let conn = self.lock()?;
        let selected = conn
            .query_row(
                "SELECT group_id, server_id FROM selection WHERE slot = 0",
                [],
                |row| {
                    Ok(SelectedServer {
                        group_id: row.get(0)?,
                        server_id: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(selected)
    }

    async fn set_selected(&self, selected: &SelectedServer) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
                INSERT INTO selection (slot, group_id, server_id)
                VALUES (0, ?1, ?2)
                ON CONFLICT(slot) DO UPDATE SET
                    group_id = excluded.group_id,
                    server_id = excluded.server_id
                "#,
            params![selected.group_id, selected.server_id],
        )?;
        Ok(())
    }
}

// ============================================================================
// In-memory Implementation
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    groups: Vec<Group>,
    servers: HashMap<String, ServerConfig>,
    order: Vec<String>,
    affiliations: HashMap<String, AffiliationInfo>,
    selected: Option<SelectedServer>,
}

impl MemoryState {
    fn group_members(&self, group_id: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.servers
                    .get(*id)
                    .is_some_and(|config| config.group_id == group_id)
            })
            .cloned()
            .collect()
    }

    fn drop_dangling_selection(&mut self) {
        if self
            .selected
            .as_ref()
            .is_some_and(|selected| !self.servers.contains_key(&selected.server_id))
        {
            self.selected = None;
        }
    }
}

/// In-memory implementation of ServerRepository
///
/// Useful for testing without database dependencies.
#[derive(Debug, Default)]
pub struct MemoryServerRepository {
    state: RwLock<MemoryState>,
}

impl MemoryServerRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryState>> {
        Ok(self.state.read().map_err(|_| StorageError::Poisoned)?)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>> {
        Ok(self.state.write().map_err(|_| StorageError::Poisoned)?)
    }
}

#[async_trait]
impl ServerRepository for MemoryServerRepository {
    async fn list_groups(&self) -> Result<Vec<Group>> {
        Ok(self.read()?.groups.clone())
    }

    async fn get_group(&self, id: &str) -> Result<Option<Group>> {
        Ok(self.read()?.groups.iter().find(|g| g.id == id).cloned())
    }

    async fn save_group(&self, group: &Group) -> Result<()> {
        let mut state = self.write()?;
        match state.groups.iter_mut().find(|g| g.id == group.id) {
            Some(existing) => *existing = group.clone(),
            None => state.groups.push(group.clone()),
        }
        Ok(())
    }

    async fn list_server_ids(&self, group_id: &str) -> Result<Vec<String>> {
        Ok(self.read()?.group_members(group_id))
    }

    async fn list_all_server_ids(&self) -> Result<Vec<String>> {
        Ok(self.read()?.order.clone())
    }

    async fn get_config(&self, id: &str) -> Result<Option<ServerConfig>> {
        Ok(self.read()?.servers.get(id).cloned())
    }

    async fn add_server(&self, config: &ServerConfig) -> Result<()> {
        let mut state = self.write()?;
        if state
            .servers
            .insert(config.id.clone(), config.clone())
            .is_none()
        {
            state.order.push(config.id.clone());
        }
        Ok(())
    }

    async fn replace_group_servers(
        &self,
        group_id: &str,
        configs: Vec<ServerConfig>,
    ) -> Result<Vec<String>> {
        let mut state = self.write()?;

        let stale: HashSet<String> = state.group_members(group_id).into_iter().collect();
        state.order.retain(|id| !stale.contains(id));
        state.servers.retain(|id, _| !stale.contains(id));

        let mut ids = Vec::with_capacity(configs.len());
        for mut config in configs {
            config.group_id = group_id.to_string();
            ids.push(config.id.clone());
            if state
                .servers
                .insert(config.id.clone(), config.clone())
                .is_none()
            {
                state.order.push(config.id);
            }
        }
        state.drop_dangling_selection();
        Ok(ids)
    }

    async fn remove_server(&self, id: &str) -> Result<()> {
        let mut state = self.write()?;
        if state.servers.remove(id).is_some() {
            state.order.retain(|existing| existing != id);
            state.drop_dangling_selection();
        }
        Ok(())
    }

    async fn set_server_order(&self, group_id: &str, ids: &[String]) -> Result<()> {
        let mut state = self.write()?;
        let members = state.group_members(group_id);
        let member_set: HashSet<&String> = members.iter().collect();
        let mut reordered = merge_order(&members, ids).into_iter();

        let order: Vec<String> = state
            .order
            .iter()
            .map(|id| {
                if member_set.contains(id) {
                    reordered.next().unwrap_or_else(|| id.clone())
                } else {
                    id.clone()
                }
            })
            .collect();

        state.order = order;
        Ok(())
    }

    async fn get_affiliation(&self, id: &str) -> Result<Option<AffiliationInfo>> {
        Ok(self.read()?.affiliations.get(id).copied())
    }

    async fn set_affiliation(&self, id: &str, info: &AffiliationInfo) -> Result<()> {
        self.write()?.affiliations.insert(id.to_string(), *info);
        Ok(())
    }

    async fn clear_affiliations(&self, ids: &[String]) -> Result<()> {
        let mut state = self.write()?;
        for id in ids {
            state.affiliations.remove(id);
        }
        Ok(())
    }

    async fn get_selected(&self) -> Result<Option<SelectedServer>> {
        Ok(self.read()?.selected.clone())
    }

    async fn set_selected(&self, selected: &SelectedServer) -> Result<()> {
        self.write()?.selected = Some(selected.clone());
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
