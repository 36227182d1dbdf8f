//! Session and role resolution.
//!
//! On every auth-state change the resolver decides whether the signed-in
//! principal is a shop owner, a staff member, or a guest, and loads the
//! associated shop profile. The staff lookup strictly precedes the
//! owner/guest lookup: when both a staff record and a shop record exist for
//! the same id, the principal is staff.
//!
//! Also owns the account flows: registration, login with failed-attempt
//! tracking and lockout, guest accounts, federated sign-in, and password
//! changes. The lockout flow is the only place a credential-store error is
//! replaced (invalid credentials may become [`Error::AccountLocked`]);
//! everything else, rate limiting included, is re-raised verbatim.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};
use tracing::{error, info, warn};

use crate::credentials::{AuthUser, CredentialStore, FederatedProfile, SubscriptionId};
use crate::db::DbState;
use crate::error::{Error, Result};
use crate::policy;
use crate::staff::{self, StaffRecord};

/// Failed logins (from zero) before the shop account is locked.
const MAX_FAILED_ATTEMPTS: u32 = 5;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The role a principal resolves to. Derived on every auth-state change,
/// never stored on the principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Staff,
    Guest,
    None,
}

/// Capability set granted to guest accounts. Field names match the
/// document keys the frontend reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuestPermissions {
    pub can_access_new_receipt: bool,
    pub can_access_receipts: bool,
    pub can_access_stock: bool,
    pub can_access_employees: bool,
    pub can_access_settings: bool,
    pub can_access_analytics: bool,
    pub can_access_salary: bool,
    pub can_access_attendance: bool,
    pub can_access_expenses: bool,
}

impl GuestPermissions {
    /// The fixed default set for new guest accounts: only receipt creation.
    pub fn default_guest() -> Self {
        Self {
            can_access_new_receipt: true,
            ..Self::default()
        }
    }
}

/// A shop profile document.
#[derive(Debug, Clone, Serialize)]
pub struct ShopRecord {
    pub id: String,
    pub shop_name: Option<String>,
    pub user_email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
    pub auth_provider: String,
    pub account_status: String,
    pub is_guest: bool,
    pub guest_permissions: Option<GuestPermissions>,
    pub failed_login_attempts: u32,
    pub created_at: Option<String>,
    pub last_login_at: Option<String>,
    pub last_failed_login_at: Option<String>,
    pub locked_at: Option<String>,
    pub last_password_change: Option<String>,
}

/// Details captured at registration time.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShopDetails {
    pub shop_name: String,
    pub phone: Option<String>,
    pub address: Option<String>,
}

/// Typed patch for `update_shop_data`. Only set fields are written.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShopPatch {
    pub shop_name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub display_name: Option<String>,
}

/// The resolved session state published to the rest of the system.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub current_user: Option<AuthUser>,
    pub role: Role,
    pub shop_data: Option<ShopRecord>,
    pub staff_data: Option<StaffRecord>,
    pub loading: bool,
}

impl SessionState {
    fn initial() -> Self {
        Self {
            current_user: None,
            role: Role::None,
            shop_data: None,
            staff_data: None,
            loading: true,
        }
    }

    pub fn is_staff(&self) -> bool {
        self.role == Role::Staff
    }

    pub fn is_guest(&self) -> bool {
        self.role == Role::Guest
    }

    /// The owning shop's id: the staff record's `shop_id` for staff, the
    /// principal's own id otherwise.
    pub fn primary_shop_id(&self) -> Option<String> {
        if self.role == Role::Staff {
            if let Some(staff) = &self.staff_data {
                return Some(staff.shop_id.clone());
            }
        }
        self.current_user.as_ref().map(|u| u.uid.clone())
    }
}

type Watcher = Box<dyn Fn(&SessionState) + Send + Sync>;

/// Session & role resolver service. Constructed once at application root
/// and shared by reference; `start()` subscribes to auth-state changes,
/// `stop()` unsubscribes.
pub struct SessionService {
    db: Arc<DbState>,
    credentials: Arc<CredentialStore>,
    state: Mutex<SessionState>,
    subscription: Mutex<Option<SubscriptionId>>,
    watchers: Mutex<Vec<Watcher>>,
}

// ---------------------------------------------------------------------------
// Shop document helpers
// ---------------------------------------------------------------------------

const SHOP_COLUMNS: &str = "id, shop_name, user_email, phone, address, display_name, photo_url, \
     auth_provider, account_status, is_guest, guest_permissions, failed_login_attempts, \
     created_at, last_login_at, last_failed_login_at, locked_at, last_password_change";

fn row_to_shop(row: &Row<'_>) -> rusqlite::Result<ShopRecord> {
    let guest_permissions: Option<String> = row.get(10)?;
    Ok(ShopRecord {
        id: row.get(0)?,
        shop_name: row.get(1)?,
        user_email: row.get(2)?,
        phone: row.get(3)?,
        address: row.get(4)?,
        display_name: row.get(5)?,
        photo_url: row.get(6)?,
        auth_provider: row.get(7)?,
        account_status: row.get(8)?,
        is_guest: row.get(9)?,
        guest_permissions: guest_permissions
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok()),
        failed_login_attempts: row.get(11)?,
        created_at: row.get(12)?,
        last_login_at: row.get(13)?,
        last_failed_login_at: row.get(14)?,
        locked_at: row.get(15)?,
        last_password_change: row.get(16)?,
    })
}

/// Fetch a shop profile by owner id.
pub fn get_shop(conn: &Connection, id: &str) -> Result<Option<ShopRecord>> {
    let record = conn
        .query_row(
            &format!("SELECT {SHOP_COLUMNS} FROM shops WHERE id = ?1"),
            params![id],
            row_to_shop,
        )
        .optional()?;
    Ok(record)
}

fn get_shop_by_email(conn: &Connection, email: &str) -> Result<Option<ShopRecord>> {
    let record = conn
        .query_row(
            &format!("SELECT {SHOP_COLUMNS} FROM shops WHERE user_email = ?1"),
            params![email],
            row_to_shop,
        )
        .optional()?;
    Ok(record)
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

impl SessionService {
    pub fn new(db: Arc<DbState>, credentials: Arc<CredentialStore>) -> Self {
        Self {
            db,
            credentials,
            state: Mutex::new(SessionState::initial()),
            subscription: Mutex::new(None),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to auth-state changes. Fires once immediately with the
    /// current session, then on every sign-in/sign-out.
    pub fn start(self: &Arc<Self>) {
        let mut subscription = self
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if subscription.is_some() {
            return;
        }
        let weak: Weak<SessionService> = Arc::downgrade(self);
        let id = self.credentials.subscribe(Box::new(move |user| {
            if let Some(service) = weak.upgrade() {
                service.on_auth_change(user);
            }
        }));
        *subscription = Some(id);
    }

    /// Unsubscribe from auth-state changes.
    pub fn stop(&self) {
        let id = self
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(id) = id {
            self.credentials.unsubscribe(id);
        }
    }

    /// Register a watcher invoked after every published state change.
    pub fn add_watcher(&self, watcher: Watcher) {
        self.watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(watcher);
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Resolve role and profiles for the given principal and publish the
    /// result. Resolution failures fail safe: the state is cleared (role
    /// `None`, loading finished) rather than left half-populated.
    fn on_auth_change(&self, user: Option<&AuthUser>) {
        let next = match user {
            None => SessionState {
                current_user: None,
                role: Role::None,
                shop_data: None,
                staff_data: None,
                loading: false,
            },
            Some(user) => match self.resolve(user) {
                Ok(state) => state,
                Err(e) => {
                    error!(uid = %user.uid, error = %e, "session resolution failed");
                    SessionState {
                        current_user: Some(user.clone()),
                        role: Role::None,
                        shop_data: None,
                        staff_data: None,
                        loading: false,
                    }
                }
            },
        };
        self.publish(next);
    }

    fn resolve(&self, user: &AuthUser) -> Result<SessionState> {
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());

        // Staff lookup strictly precedes the shop lookup; staff wins ties.
        if let Some(staff_record) = staff::get_staff(&conn, &user.uid)? {
            let shop = get_shop(&conn, &staff_record.shop_id)?;
            return Ok(SessionState {
                current_user: Some(user.clone()),
                role: Role::Staff,
                shop_data: shop,
                staff_data: Some(staff_record),
                loading: false,
            });
        }

        let shop = get_shop(&conn, &user.uid)?;
        let role = match &shop {
            Some(shop) if shop.is_guest => Role::Guest,
            // A missing shop profile is an owner that has not been
            // provisioned yet.
            _ => Role::Owner,
        };
        Ok(SessionState {
            current_user: Some(user.clone()),
            role,
            shop_data: shop,
            staff_data: None,
            loading: false,
        })
    }

    fn publish(&self, next: SessionState) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            *state = next;
        }
        let state = self.snapshot();
        let watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        for watcher in watchers.iter() {
            watcher(&state);
        }
    }

    // -----------------------------------------------------------------------
    // Account flows
    // -----------------------------------------------------------------------

    /// Register a new shop: policy check, credential identity, shop profile,
    /// then sign the owner in.
    pub fn register_shop(
        &self,
        email: &str,
        password: &str,
        details: &ShopDetails,
    ) -> Result<AuthUser> {
        policy::validate_password(password)?;

        let user = self.credentials.sign_up(email, password)?;
        let now = Utc::now().to_rfc3339();
        {
            let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.execute(
                "INSERT INTO shops (id, shop_name, user_email, phone, address,
                                    created_at, last_password_change, account_status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 'active')",
                params![
                    user.uid,
                    details.shop_name,
                    user.email,
                    details.phone,
                    details.address,
                    now,
                ],
            )?;
        }

        info!(shop_id = %user.uid, "shop registered");
        self.credentials.sign_in(email, password)
    }

    /// Authenticate, with failed-attempt bookkeeping on the shop profile.
    ///
    /// Success resets `failed_login_attempts` and stamps `last_login_at`.
    /// An invalid-credential failure with a resolvable email increments the
    /// counter; the strike that reaches `MAX_FAILED_ATTEMPTS` locks the
    /// account and raises [`Error::AccountLocked`] in place of the
    /// credential error. Every other failure, rate limiting included,
    /// propagates unchanged. Bookkeeping failures never mask the original
    /// error.
    pub fn login(&self, email: &str, password: &str) -> Result<AuthUser> {
        match self.credentials.sign_in(email, password) {
            Ok(user) => {
                if let Err(e) = self.record_login_success(&user) {
                    warn!(uid = %user.uid, error = %e, "login bookkeeping failed");
                }
                // Re-resolve so the published profile reflects the reset.
                self.on_auth_change(Some(&user));
                Ok(user)
            }
            Err(Error::InvalidCredentials) => {
                match self.record_login_failure(email) {
                    Ok(true) => Err(Error::AccountLocked),
                    Ok(false) => Err(Error::InvalidCredentials),
                    Err(e) => {
                        warn!(email = %email, error = %e, "failed-login bookkeeping failed");
                        Err(Error::InvalidCredentials)
                    }
                }
            }
            Err(other) => Err(other),
        }
    }

    fn record_login_success(&self, user: &AuthUser) -> Result<()> {
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE shops SET failed_login_attempts = 0, last_login_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), user.uid],
        )?;
        Ok(())
    }

    /// Returns `Ok(true)` when the failure locked the account.
    fn record_login_failure(&self, email: &str) -> Result<bool> {
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        let email = email.trim().to_ascii_lowercase();
        let Some(shop) = get_shop_by_email(&conn, &email)? else {
            return Ok(false);
        };

        let attempts = shop.failed_login_attempts + 1;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE shops SET failed_login_attempts = ?1, last_failed_login_at = ?2 WHERE id = ?3",
            params![attempts, now, shop.id],
        )?;

        if attempts >= MAX_FAILED_ATTEMPTS {
            conn.execute(
                "UPDATE shops SET account_status = 'locked', locked_at = ?1 WHERE id = ?2",
                params![now, shop.id],
            )?;
            warn!(shop_id = %shop.id, attempts, "shop account locked");
            return Ok(true);
        }
        Ok(false)
    }

    /// Sign the current principal out.
    pub fn logout(&self) {
        self.credentials.sign_out();
    }

    /// Create a guest account: a credential identity plus a guest shop
    /// profile with the fixed minimal capability set. Rejects when any
    /// account already exists for the email.
    pub fn create_guest_account(&self, email: &str, password: &str) -> Result<()> {
        let normalized = email.trim().to_ascii_lowercase();
        {
            let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
            let taken: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM staff WHERE email = ?1)
                 OR EXISTS(SELECT 1 FROM shops WHERE user_email = ?1)",
                params![normalized],
                |row| row.get(0),
            )?;
            if taken {
                return Err(Error::EmailInUse(
                    "Guest account with this email already exists",
                ));
            }
        }

        let user = self.credentials.sign_up(email, password)?;
        let permissions = serde_json::to_string(&GuestPermissions::default_guest())
            .unwrap_or_else(|_| "{}".into());
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO shops (id, shop_name, user_email, phone, address,
                                created_at, is_guest, guest_permissions)
             VALUES (?1, 'Guest Account', ?2, '', '', ?3, 1, ?4)",
            params![user.uid, user.email, Utc::now().to_rfc3339(), permissions],
        )?;

        info!(shop_id = %user.uid, "guest account created");
        Ok(())
    }

    /// Sign in as a guest. Requires a pre-existing guest shop profile for
    /// the email; after authentication the signed-in identity's profile is
    /// re-verified, and a non-guest result signs back out rather than
    /// leaving the session half-authenticated.
    pub fn login_as_guest(&self, email: &str, password: &str) -> Result<AuthUser> {
        let normalized = email.trim().to_ascii_lowercase();
        {
            let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
            let is_guest: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM shops WHERE user_email = ?1 AND is_guest = 1)",
                params![normalized],
                |row| row.get(0),
            )?;
            if !is_guest {
                return Err(Error::NotFound("Guest account not found"));
            }
        }

        let user = self.credentials.sign_in(email, password)?;

        let still_guest = {
            let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
            get_shop(&conn, &user.uid)?.is_some_and(|shop| shop.is_guest)
        };
        if !still_guest {
            warn!(uid = %user.uid, "guest login resolved to a non-guest account, signing out");
            self.credentials.sign_out();
            return Err(Error::NotAGuestAccount);
        }
        Ok(user)
    }

    /// Federated sign-in. Provisions a shop profile on the identity's first
    /// sign-in; otherwise stamps `last_login_at`.
    pub fn login_with_google(&self, profile: &FederatedProfile) -> Result<AuthUser> {
        let user = self.credentials.sign_in_federated(profile)?;
        let now = Utc::now().to_rfc3339();
        {
            let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
            let exists = get_shop(&conn, &user.uid)?.is_some();
            if exists {
                conn.execute(
                    "UPDATE shops SET last_login_at = ?1 WHERE id = ?2",
                    params![now, user.uid],
                )?;
            } else {
                conn.execute(
                    "INSERT INTO shops (id, user_email, display_name, photo_url,
                                        created_at, last_login_at, account_status, auth_provider)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5, 'active', 'google')",
                    params![
                        user.uid,
                        user.email,
                        profile.display_name.clone().unwrap_or_default(),
                        profile.photo_url.clone().unwrap_or_default(),
                        now,
                    ],
                )?;
                info!(shop_id = %user.uid, "shop profile provisioned for federated identity");
            }
        }
        self.on_auth_change(Some(&user));
        Ok(user)
    }

    /// Change the current user's password, enforcing the policy first.
    pub fn change_password(&self, new_password: &str) -> Result<()> {
        let user = self.credentials.current_user().ok_or(Error::NoUser)?;
        policy::validate_password(new_password)?;
        self.credentials.update_password(new_password)?;

        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE shops SET last_password_change = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), user.uid],
        )?;
        Ok(())
    }

    /// Fetch a shop profile by id and publish it as the current shop data.
    pub fn get_shop_data(&self, shop_id: &str) -> Result<Option<ShopRecord>> {
        let record = {
            let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
            get_shop(&conn, shop_id)?
        };
        if record.is_some() {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.shop_data = record.clone();
        }
        Ok(record)
    }

    /// Apply a typed patch to the current user's shop profile.
    pub fn update_shop_data(&self, patch: &ShopPatch) -> Result<()> {
        let user = self.credentials.current_user().ok_or(Error::NoUser)?;

        let mut assignments = Vec::new();
        let mut values: Vec<&dyn rusqlite::ToSql> = Vec::new();
        if let Some(shop_name) = &patch.shop_name {
            assignments.push("shop_name = ?");
            values.push(shop_name);
        }
        if let Some(phone) = &patch.phone {
            assignments.push("phone = ?");
            values.push(phone);
        }
        if let Some(address) = &patch.address {
            assignments.push("address = ?");
            values.push(address);
        }
        if let Some(display_name) = &patch.display_name {
            assignments.push("display_name = ?");
            values.push(display_name);
        }
        if assignments.is_empty() {
            return Ok(());
        }
        values.push(&user.uid);

        {
            let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
            let sql = format!(
                "UPDATE shops SET {} WHERE id = ?",
                assignments.join(", ")
            );
            let updated = conn.execute(&sql, rusqlite::params_from_iter(values))?;
            if updated == 0 {
                return Err(Error::NotFound("Shop not found"));
            }
        }

        // Merge into the published state.
        self.on_auth_change(Some(&user));
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
