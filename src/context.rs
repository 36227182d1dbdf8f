//! The shop context: the single surface the page/form layer consumes.
//!
//! Wires the credential store, session resolver, and branch manager
//! together and exposes their combined state as one snapshot plus the full
//! set of account, branch, staff, and invoice operations. Constructed once
//! at application root and passed by reference; `start()` subscribes to
//! auth-state changes and keeps branch scope in sync with the resolved
//! principal, `stop()` unsubscribes.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::branches::{Branch, BranchManager};
use crate::credentials::{AuthUser, CredentialStore, FederatedProfile};
use crate::db::DbState;
use crate::error::Result;
use crate::invoices;
use crate::session::{Role, SessionService, ShopDetails, ShopPatch, ShopRecord};
use crate::staff::{self, NewStaff, StaffPermissions, StaffRecord};

/// Everything the frontend binds to, in the shape it expects.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub current_user: Option<AuthUser>,
    pub shop_data: Option<ShopRecord>,
    pub staff_data: Option<StaffRecord>,
    pub loading: bool,
    pub is_guest: bool,
    pub is_staff: bool,
    pub primary_shop_id: Option<String>,
    pub active_shop_id: Option<String>,
    pub active_branch_id: Option<String>,
    pub branches: Vec<Branch>,
    pub branches_loading: bool,
    pub is_default_branch: bool,
}

pub struct ShopContext {
    db: Arc<DbState>,
    credentials: Arc<CredentialStore>,
    session: Arc<SessionService>,
    branches: Arc<BranchManager>,
    started: AtomicBool,
}

impl ShopContext {
    pub fn new(db: Arc<DbState>) -> Arc<Self> {
        let credentials = Arc::new(CredentialStore::new(Arc::clone(&db)));
        let session = Arc::new(SessionService::new(
            Arc::clone(&db),
            Arc::clone(&credentials),
        ));
        let branches = Arc::new(BranchManager::new(Arc::clone(&db)));
        Arc::new(Self {
            db,
            credentials,
            session,
            branches,
            started: AtomicBool::new(false),
        })
    }

    /// Subscribe to auth-state changes and keep branch scope in sync with
    /// the resolved principal. Branch state reloads whenever the primary
    /// shop (or the resolved role) changes, including sign-out.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let branches = Arc::clone(&self.branches);
        let last_scope: Mutex<Option<(Option<String>, Role)>> = Mutex::new(None);
        self.session.add_watcher(Box::new(move |state| {
            let scope = (state.primary_shop_id(), state.role);
            let mut last = last_scope.lock().unwrap_or_else(|e| e.into_inner());
            if last.as_ref() == Some(&scope) {
                return;
            }
            *last = Some(scope.clone());
            branches.reload(scope.0.as_deref(), scope.1);
        }));

        self.session.start();
    }

    /// Unsubscribe from auth-state changes.
    pub fn stop(&self) {
        self.session.stop();
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let session = self.session.snapshot();
        let branches = self.branches.snapshot();
        ContextSnapshot {
            is_guest: session.is_guest(),
            is_staff: session.is_staff(),
            primary_shop_id: session.primary_shop_id(),
            current_user: session.current_user,
            shop_data: session.shop_data,
            staff_data: session.staff_data,
            loading: session.loading,
            active_shop_id: branches.active_shop_id(),
            active_branch_id: branches.active_branch_id.clone(),
            is_default_branch: branches.is_default_branch(),
            branches_loading: branches.loading,
            branches: branches.branches,
        }
    }

    // -----------------------------------------------------------------------
    // Account operations
    // -----------------------------------------------------------------------

    pub fn register_shop(
        &self,
        email: &str,
        password: &str,
        details: &ShopDetails,
    ) -> Result<AuthUser> {
        self.session.register_shop(email, password, details)
    }

    pub fn login(&self, email: &str, password: &str) -> Result<AuthUser> {
        self.session.login(email, password)
    }

    pub fn logout(&self) {
        self.session.logout();
    }

    pub fn create_guest_account(&self, email: &str, password: &str) -> Result<()> {
        self.session.create_guest_account(email, password)
    }

    pub fn login_as_guest(&self, email: &str, password: &str) -> Result<AuthUser> {
        self.session.login_as_guest(email, password)
    }

    pub fn login_with_google(&self, profile: &FederatedProfile) -> Result<AuthUser> {
        self.session.login_with_google(profile)
    }

    pub fn change_password(&self, new_password: &str) -> Result<()> {
        self.session.change_password(new_password)
    }

    pub fn get_shop_data(&self, shop_id: &str) -> Result<Option<ShopRecord>> {
        self.session.get_shop_data(shop_id)
    }

    pub fn update_shop_data(&self, patch: &ShopPatch) -> Result<()> {
        self.session.update_shop_data(patch)
    }

    // -----------------------------------------------------------------------
    // Branch operations
    // -----------------------------------------------------------------------

    pub fn select_branch(&self, branch_id: &str) {
        self.branches.select_branch(branch_id);
    }

    pub fn add_branch(&self, name: &str) -> Result<Branch> {
        self.branches.add_branch(name)
    }

    pub fn delete_branch(&self, branch_id: &str) -> Result<()> {
        self.branches.delete_branch(branch_id)
    }

    // -----------------------------------------------------------------------
    // Staff operations (owner-gated)
    // -----------------------------------------------------------------------

    pub fn list_staff(&self) -> Result<Vec<StaffRecord>> {
        let state = self.session.snapshot();
        let shop_id = state.primary_shop_id().ok_or(crate::error::Error::NoShop)?;
        staff::list_staff(&self.db, &shop_id)
    }

    pub fn create_staff(&self, req: &NewStaff) -> Result<StaffRecord> {
        let state = self.session.snapshot();
        let owner_id = state.primary_shop_id().ok_or(crate::error::Error::NoShop)?;
        staff::create_staff(&self.db, &self.credentials, state.role, &owner_id, req)
    }

    pub fn update_staff(
        &self,
        staff_id: &str,
        name: &str,
        permissions: &StaffPermissions,
    ) -> Result<()> {
        let role = self.session.snapshot().role;
        staff::update_staff(&self.db, role, staff_id, name, permissions)
    }

    pub fn delete_staff(&self, staff_id: &str) -> Result<()> {
        let role = self.session.snapshot().role;
        staff::delete_staff(&self.db, role, staff_id)
    }

    pub fn revoke_staff_credential(&self, staff_id: &str) -> Result<()> {
        let role = self.session.snapshot().role;
        staff::revoke_staff_credential(&self.credentials, role, staff_id)
    }

    // -----------------------------------------------------------------------
    // Invoice numbering
    // -----------------------------------------------------------------------

    /// Allocate an invoice number. With a shop id this is the gap-free
    /// per-shop sequence; without one it falls back to the legacy random
    /// token for call sites that do not yet scope invoices per shop.
    pub fn allocate_invoice_number(&self, shop_id: Option<&str>) -> Result<String> {
        match shop_id {
            Some(shop_id) => invoices::allocate(&self.db, shop_id),
            None => Ok(invoices::legacy_token()),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::error::Error;

    const PW: &str = "Str0ng!pass";

    fn context() -> Arc<ShopContext> {
        let ctx = ShopContext::new(Arc::new(db::test_state()));
        ctx.start();
        ctx
    }

    fn details() -> ShopDetails {
        ShopDetails {
            shop_name: "Corner Shop".into(),
            phone: None,
            address: None,
        }
    }

    #[test]
    fn signed_out_snapshot_is_settled_and_empty() {
        let ctx = context();
        let snap = ctx.snapshot();
        assert!(!snap.loading);
        assert!(!snap.branches_loading);
        assert!(snap.current_user.is_none());
        assert!(snap.primary_shop_id.is_none());
        assert!(snap.active_shop_id.is_none());
        assert!(snap.branches.is_empty());
    }

    #[test]
    fn registration_resolves_owner_and_default_branch() {
        let ctx = context();
        let user = ctx
            .register_shop("owner@x.test", PW, &details())
            .expect("register");

        let snap = ctx.snapshot();
        assert!(!snap.is_staff && !snap.is_guest);
        assert_eq!(snap.primary_shop_id.as_deref(), Some(user.uid.as_str()));
        assert_eq!(snap.active_shop_id.as_deref(), Some(user.uid.as_str()));
        assert_eq!(snap.active_branch_id.as_deref(), Some(user.uid.as_str()));
        assert!(snap.is_default_branch);
        assert_eq!(snap.branches.len(), 1);
        assert_eq!(snap.branches[0].name, "Main Branch");
    }

    #[test]
    fn adding_a_branch_switches_the_scoping_id() {
        let ctx = context();
        ctx.register_shop("owner@x.test", PW, &details())
            .expect("register");

        let branch = ctx.add_branch("Uptown").expect("add branch");
        let snap = ctx.snapshot();
        assert_eq!(snap.active_branch_id.as_deref(), Some(branch.id.as_str()));
        assert_eq!(snap.active_shop_id.as_deref(), Some(branch.id.as_str()));
        assert!(!snap.is_default_branch);

        ctx.select_branch(snap.primary_shop_id.as_deref().expect("primary"));
        assert!(ctx.snapshot().is_default_branch);
    }

    #[test]
    fn logout_clears_both_session_and_branch_scope() {
        let ctx = context();
        ctx.register_shop("owner@x.test", PW, &details())
            .expect("register");
        ctx.add_branch("Uptown").expect("add branch");

        ctx.logout();
        let snap = ctx.snapshot();
        assert!(snap.current_user.is_none());
        assert!(snap.primary_shop_id.is_none());
        assert!(snap.active_shop_id.is_none());
        assert!(snap.branches.is_empty());
    }

    #[test]
    fn staff_sees_employer_scope_but_cannot_mutate_branches() {
        let ctx = context();
        let owner = ctx
            .register_shop("boss@x.test", PW, &details())
            .expect("register owner");
        ctx.add_branch("Uptown").expect("owner adds a branch");
        ctx.create_staff(&NewStaff {
            name: "Sam".into(),
            email: "sam@x.test".into(),
            password: PW.into(),
            permissions: StaffPermissions::default(),
        })
        .expect("create staff");
        ctx.logout();

        ctx.login("sam@x.test", PW).expect("staff login");
        let snap = ctx.snapshot();
        assert!(snap.is_staff);
        assert_eq!(snap.primary_shop_id.as_deref(), Some(owner.uid.as_str()));
        assert_eq!(snap.branches.len(), 2, "staff sees the employer's branches");

        assert!(matches!(
            ctx.add_branch("Forbidden").unwrap_err(),
            Error::Forbidden(_)
        ));
        assert!(matches!(
            ctx.delete_branch(&snap.branches[1].id).unwrap_err(),
            Error::Forbidden(_)
        ));
        assert!(matches!(
            ctx.create_staff(&NewStaff {
                name: "X".into(),
                email: "x@x.test".into(),
                password: PW.into(),
                permissions: StaffPermissions::default(),
            })
            .unwrap_err(),
            Error::Forbidden(_)
        ));
    }

    #[test]
    fn guest_cannot_mutate_branches() {
        let ctx = context();
        ctx.create_guest_account("guest@x.test", PW)
            .expect("create guest");
        ctx.login_as_guest("guest@x.test", PW).expect("guest login");

        let snap = ctx.snapshot();
        assert!(snap.is_guest);
        assert_eq!(snap.branches.len(), 1, "guest gets a default branch too");
        assert!(matches!(
            ctx.add_branch("Nope").unwrap_err(),
            Error::Forbidden(_)
        ));
    }

    #[test]
    fn invoice_numbers_flow_through_the_context() {
        let ctx = context();
        let user = ctx
            .register_shop("owner@x.test", PW, &details())
            .expect("register");

        assert_eq!(
            ctx.allocate_invoice_number(Some(&user.uid)).expect("first"),
            "1"
        );
        assert_eq!(
            ctx.allocate_invoice_number(Some(&user.uid)).expect("second"),
            "2"
        );

        let token = ctx.allocate_invoice_number(None).expect("legacy");
        assert_eq!(token.len(), 8);
    }

    #[test]
    fn branch_preference_survives_re_login() {
        let ctx = context();
        ctx.register_shop("owner@x.test", PW, &details())
            .expect("register");
        let branch = ctx.add_branch("Uptown").expect("add branch");

        ctx.logout();
        ctx.login("owner@x.test", PW).expect("re-login");

        let snap = ctx.snapshot();
        assert_eq!(
            snap.active_branch_id.as_deref(),
            Some(branch.id.as_str()),
            "persisted preference restored"
        );
    }

    #[test]
    fn deleted_branch_preference_falls_back_to_default() {
        let ctx = context();
        let user = ctx
            .register_shop("owner@x.test", PW, &details())
            .expect("register");
        let branch = ctx.add_branch("Uptown").expect("add branch");
        ctx.logout();

        // The branch disappears while the preference still names it.
        {
            let conn = ctx.db.conn.lock().expect("db lock");
            conn.execute(
                "DELETE FROM branches WHERE id = ?1",
                rusqlite::params![branch.id],
            )
            .expect("drop branch row");
        }

        ctx.login("owner@x.test", PW).expect("re-login");
        let snap = ctx.snapshot();
        assert_eq!(
            snap.active_branch_id.as_deref(),
            Some(user.uid.as_str()),
            "stale preference corrected to the primary shop id"
        );
        let conn = ctx.db.conn.lock().expect("db lock");
        assert_eq!(
            db::get_setting(
                &conn,
                "branches",
                &format!("activeBranch_{}", user.uid)
            )
            .as_deref(),
            Some(user.uid.as_str()),
            "stored preference rewritten"
        );
    }

    #[test]
    fn staff_lifecycle_through_the_context() {
        let ctx = context();
        ctx.register_shop("boss@x.test", PW, &details())
            .expect("register owner");
        let record = ctx
            .create_staff(&NewStaff {
                name: "Sam".into(),
                email: "sam@x.test".into(),
                password: PW.into(),
                permissions: StaffPermissions::default(),
            })
            .expect("create");

        assert_eq!(ctx.list_staff().expect("list").len(), 1);

        let mut perms = StaffPermissions::default();
        perms.can_view_receipts = true;
        ctx.update_staff(&record.id, "Sam II", &perms).expect("update");

        ctx.delete_staff(&record.id).expect("delete");
        assert!(ctx.list_staff().expect("list").is_empty());

        ctx.revoke_staff_credential(&record.id).expect("revoke");
        ctx.logout();
        assert!(matches!(
            ctx.login("sam@x.test", PW).unwrap_err(),
            Error::Revoked
        ));
    }
}
