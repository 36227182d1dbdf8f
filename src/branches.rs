//! Branch scoping.
//!
//! Every shop has at least one branch whose id equals the shop's own id
//! (the "Main Branch"); it is materialized lazily for shops created before
//! branch support existed and can never be deleted. Business records are
//! tagged with the *active* branch id, so the manager also owns the
//! persisted active-branch preference (`local_settings`, category
//! `branches`, key `activeBranch_<primaryShopId>`).
//!
//! Loads are tagged with a generation counter; a load superseded by a newer
//! `primary_shop_id` discards its result instead of clobbering state.

use chrono::Utc;
use rusqlite::params;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::error::{Error, Result};
use crate::session::Role;

/// Name given to the lazily materialized default branch.
pub const DEFAULT_BRANCH_NAME: &str = "Main Branch";
/// Settings category holding active-branch preferences.
const SETTINGS_CATEGORY: &str = "branches";

/// A branch document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Branch {
    pub id: String,
    pub name: String,
    pub is_default: bool,
    pub created_by: Option<String>,
    pub created_at: String,
}

/// Branch state for the current principal.
#[derive(Debug, Clone)]
pub struct BranchState {
    pub branches: Vec<Branch>,
    pub active_branch_id: Option<String>,
    pub primary_shop_id: Option<String>,
    pub role: Role,
    pub loading: bool,
}

impl BranchState {
    fn initial() -> Self {
        Self {
            branches: Vec::new(),
            active_branch_id: None,
            primary_shop_id: None,
            role: Role::None,
            loading: true,
        }
    }

    /// The scoping id used to tag and query business records.
    pub fn active_shop_id(&self) -> Option<String> {
        self.active_branch_id
            .clone()
            .or_else(|| self.primary_shop_id.clone())
    }

    pub fn is_default_branch(&self) -> bool {
        self.active_branch_id.is_some() && self.active_branch_id == self.primary_shop_id
    }
}

fn preference_key(primary_shop_id: &str) -> String {
    format!("activeBranch_{primary_shop_id}")
}

/// Branch scope manager. One instance per application, re-loaded whenever
/// the resolved `primary_shop_id` changes.
pub struct BranchManager {
    db: Arc<DbState>,
    state: Mutex<BranchState>,
    generation: AtomicU64,
}

impl BranchManager {
    pub fn new(db: Arc<DbState>) -> Self {
        Self {
            db,
            state: Mutex::new(BranchState::initial()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> BranchState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Reload branch state for a (possibly absent) primary shop. Called on
    /// every `primary_shop_id` change, including sign-out.
    pub fn reload(&self, primary_shop_id: Option<&str>, role: Role) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.loading = true;
            state.primary_shop_id = primary_shop_id.map(str::to_string);
            state.role = role;
        }

        let Some(primary) = primary_shop_id else {
            self.try_publish(generation, Vec::new(), None);
            return;
        };

        match self.load(primary) {
            Ok((branches, active)) => {
                self.try_publish(generation, branches, Some(active));
            }
            Err(e) => {
                error!(shop_id = %primary, error = %e, "failed to load branches");
                // Keep whatever was published before; just settle the flag.
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if self.generation.load(Ordering::SeqCst) == generation {
                    state.loading = false;
                }
            }
        }
    }

    /// Fetch branches, self-heal the default branch, and resolve the
    /// persisted active-branch preference.
    fn load(&self, primary: &str) -> Result<(Vec<Branch>, String)> {
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());

        let mut stmt = conn.prepare(
            "SELECT id, name, is_default, created_by, created_at
             FROM branches WHERE shop_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![primary], |row| {
            Ok(Branch {
                id: row.get(0)?,
                name: row.get(1)?,
                is_default: row.get(2)?,
                created_by: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        let mut branches = Vec::new();
        for row in rows {
            branches.push(row?);
        }
        drop(stmt);

        // Self-heal: shops created before branch support have no branch row
        // for their own id. Idempotent upsert, logged when it fires.
        if !branches.iter().any(|b| b.id == primary) {
            let created_at = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO branches (id, shop_id, name, is_default, created_at)
                 VALUES (?1, ?1, ?2, 1, ?3)
                 ON CONFLICT(id) DO NOTHING",
                params![primary, DEFAULT_BRANCH_NAME, created_at],
            )?;
            info!(shop_id = %primary, "materialized default branch");
            branches.push(Branch {
                id: primary.to_string(),
                name: DEFAULT_BRANCH_NAME.to_string(),
                is_default: true,
                created_by: None,
                created_at,
            });
        }

        // Resolve the persisted preference; fall back to (and correct to)
        // the primary shop id when it names a branch that no longer exists.
        let key = preference_key(primary);
        let stored = db::get_setting(&conn, SETTINGS_CATEGORY, &key);
        let active = match stored {
            Some(ref id) if branches.iter().any(|b| b.id == *id) => id.clone(),
            Some(ref stale) => {
                warn!(shop_id = %primary, stale_branch = %stale, "stored active branch no longer exists, falling back to default");
                primary.to_string()
            }
            None => primary.to_string(),
        };
        if let Err(e) = db::set_setting(&conn, SETTINGS_CATEGORY, &key, &active) {
            // Best-effort persistence; the resolved value still applies.
            warn!(shop_id = %primary, error = %e, "failed to persist active branch preference");
        }

        Ok((branches, active))
    }

    /// Publish a load result unless a newer load has started since.
    /// Returns whether the result was applied.
    fn try_publish(
        &self,
        generation: u64,
        branches: Vec<Branch>,
        active_branch_id: Option<String>,
    ) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "discarding superseded branch load");
            return false;
        }
        state.branches = branches;
        state.active_branch_id = active_branch_id;
        state.loading = false;
        true
    }

    /// Switch the active branch. Silently ignores empty ids, ids outside
    /// the current branch list, and calls with no primary shop.
    pub fn select_branch(&self, branch_id: &str) {
        let key = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if branch_id.is_empty() {
                return;
            }
            let Some(primary) = state.primary_shop_id.clone() else {
                return;
            };
            if !state.branches.iter().any(|b| b.id == branch_id) {
                return;
            }
            state.active_branch_id = Some(branch_id.to_string());
            preference_key(&primary)
        };

        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = db::set_setting(&conn, SETTINGS_CATEGORY, &key, branch_id) {
            warn!(branch_id = %branch_id, error = %e, "failed to persist active branch preference");
        }
    }

    /// Create a branch under the primary shop and make it active.
    /// Owner-only.
    pub fn add_branch(&self, name: &str) -> Result<Branch> {
        let (primary, role) = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            (state.primary_shop_id.clone(), state.role)
        };
        let primary = primary.ok_or(Error::NoShop)?;
        if role == Role::Staff || role == Role::Guest {
            return Err(Error::Forbidden("Only shop owners can add branches"));
        }
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(Error::Validation("Branch name is required".into()));
        }

        let branch = Branch {
            id: Uuid::new_v4().to_string(),
            name: trimmed.to_string(),
            is_default: false,
            created_by: Some(primary.clone()),
            created_at: Utc::now().to_rfc3339(),
        };
        {
            let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.execute(
                "INSERT INTO branches (id, shop_id, name, is_default, created_by, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5)",
                params![branch.id, primary, branch.name, branch.created_by, branch.created_at],
            )?;
        }

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.branches.push(branch.clone());
        }
        info!(branch_id = %branch.id, shop_id = %primary, "branch created");
        self.select_branch(&branch.id);
        Ok(branch)
    }

    /// Delete a non-default branch. Owner-only. If the branch being deleted
    /// is active, the selection switches to the primary shop id first.
    pub fn delete_branch(&self, branch_id: &str) -> Result<()> {
        let (primary, role, known, active) = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            (
                state.primary_shop_id.clone(),
                state.role,
                state.branches.iter().any(|b| b.id == branch_id),
                state.active_branch_id.clone(),
            )
        };
        let primary = primary.ok_or(Error::NoShop)?;
        if role == Role::Staff || role == Role::Guest {
            return Err(Error::Forbidden("Only shop owners can delete branches"));
        }
        if branch_id == primary {
            return Err(Error::CannotDeleteDefault);
        }
        if !known {
            return Err(Error::NotFound("Branch not found"));
        }

        if active.as_deref() == Some(branch_id) {
            self.select_branch(&primary);
        }

        {
            let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.execute(
                "DELETE FROM branches WHERE id = ?1 AND shop_id = ?2",
                params![branch_id, primary],
            )?;
        }
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.branches.retain(|b| b.id != branch_id);
        }
        info!(branch_id = %branch_id, shop_id = %primary, "branch deleted");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
