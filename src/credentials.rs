//! Local credential store with bcrypt password hashing.
//!
//! Stands in for the hosted authentication service the web frontend talked
//! to: email/password accounts, federated (Google) identities, password
//! updates, revocation, and auth-state-change notifications. Accounts live
//! in the `accounts` table; the session layer consumes this module through
//! the same seam it would use for a remote service.
//!
//! Sign-up does *not* implicitly sign the new identity in. The hosted
//! service did, which forced shop owners to re-authenticate after creating
//! a staff account; flows that want the new identity signed in (shop
//! registration) call `sign_in` explicitly afterwards.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{Error, Result};

/// Consecutive failed sign-ins for one email before throttling starts.
const RATE_LIMIT_ATTEMPTS: u32 = 10;
/// Throttle window; failures older than this are forgotten.
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

#[cfg(not(test))]
const HASH_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
const HASH_COST: u32 = 4;

/// An authenticated principal, as resolved by the credential store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AuthUser {
    pub uid: String,
    pub email: String,
}

/// Profile returned by a federated identity provider.
#[derive(Debug, Clone, Default)]
pub struct FederatedProfile {
    pub email: String,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

pub type SubscriptionId = u64;

/// Auth-state-change listener. Receives the signed-in user, or `None` on
/// sign-out. Invoked while the listener registry is locked, so listeners
/// must not subscribe or unsubscribe from inside the callback.
type Listener = Box<dyn Fn(Option<&AuthUser>) + Send + Sync>;

struct ThrottleEntry {
    failures: u32,
    last_failure: Instant,
}

/// The credential store. One instance per application, shared by reference.
pub struct CredentialStore {
    db: Arc<DbState>,
    current: Mutex<Option<AuthUser>>,
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_subscription: AtomicU64,
    throttle: Mutex<HashMap<String, ThrottleEntry>>,
}

impl CredentialStore {
    pub fn new(db: Arc<DbState>) -> Self {
        Self {
            db,
            current: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            throttle: Mutex::new(HashMap::new()),
        }
    }

    // -----------------------------------------------------------------------
    // Account lifecycle
    // -----------------------------------------------------------------------

    /// Create a new email/password identity. Does not sign it in.
    pub fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser> {
        let email = normalize_email(email)?;

        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM accounts WHERE email = ?1)",
            params![email],
            |row| row.get(0),
        )?;
        if exists {
            return Err(Error::EmailInUse("This email is already registered"));
        }

        let hash = bcrypt::hash(password, HASH_COST)?;
        let uid = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO accounts (id, email, password_hash, provider, created_at)
             VALUES (?1, ?2, ?3, 'password', ?4)",
            params![uid, email, hash, Utc::now().to_rfc3339()],
        )?;

        info!(email = %email, "credential identity created");
        Ok(AuthUser { uid, email })
    }

    /// Authenticate an email/password pair. On success the identity becomes
    /// the current user and auth-state listeners fire.
    pub fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser> {
        let email = normalize_email(email)?;
        self.check_throttle(&email)?;

        let account = {
            let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.query_row(
                "SELECT id, password_hash, revoked FROM accounts WHERE email = ?1",
                params![email],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, bool>(2)?,
                    ))
                },
            )
            .optional()?
        };

        let Some((uid, hash, revoked)) = account else {
            self.record_failure(&email);
            return Err(Error::InvalidCredentials);
        };
        if revoked {
            return Err(Error::Revoked);
        }
        let verified = hash
            .as_deref()
            .is_some_and(|h| bcrypt::verify(password, h).unwrap_or(false));
        if !verified {
            self.record_failure(&email);
            return Err(Error::InvalidCredentials);
        }

        self.clear_throttle(&email);
        let user = AuthUser { uid, email };
        self.set_current(Some(user.clone()));
        Ok(user)
    }

    /// Federated sign-in. Provisions an account for the email on first use
    /// (no password hash; the identity provider owns the credential).
    pub fn sign_in_federated(&self, profile: &FederatedProfile) -> Result<AuthUser> {
        let email = normalize_email(&profile.email)?;

        let user = {
            let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
            let existing = conn
                .query_row(
                    "SELECT id, revoked FROM accounts WHERE email = ?1",
                    params![email],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
                )
                .optional()?;

            match existing {
                Some((_, true)) => return Err(Error::Revoked),
                Some((uid, false)) => AuthUser {
                    uid,
                    email: email.clone(),
                },
                None => {
                    let uid = Uuid::new_v4().to_string();
                    conn.execute(
                        "INSERT INTO accounts (id, email, provider, created_at)
                         VALUES (?1, ?2, 'google', ?3)",
                        params![uid, email, Utc::now().to_rfc3339()],
                    )?;
                    info!(email = %email, "federated identity provisioned");
                    AuthUser {
                        uid,
                        email: email.clone(),
                    }
                }
            }
        };

        self.set_current(Some(user.clone()));
        Ok(user)
    }

    /// Replace the current user's password.
    pub fn update_password(&self, new_password: &str) -> Result<()> {
        let user = self.current_user().ok_or(Error::NoUser)?;
        let hash = bcrypt::hash(new_password, HASH_COST)?;
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        let updated = conn.execute(
            "UPDATE accounts SET password_hash = ?1 WHERE id = ?2",
            params![hash, user.uid],
        )?;
        if updated == 0 {
            return Err(Error::NotFound("Account not found"));
        }
        Ok(())
    }

    /// Sign the current user out. Auth-state listeners fire with `None`.
    pub fn sign_out(&self) {
        self.set_current(None);
    }

    /// Revoke an identity so it can no longer sign in. Separate from staff
    /// record deletion so integrators choose soft deactivation or full
    /// revocation.
    pub fn revoke(&self, uid: &str) -> Result<()> {
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        let updated = conn.execute(
            "UPDATE accounts SET revoked = 1 WHERE id = ?1",
            params![uid],
        )?;
        if updated == 0 {
            return Err(Error::NotFound("Account not found"));
        }
        info!(uid = %uid, "credential identity revoked");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Session state & subscriptions
    // -----------------------------------------------------------------------

    pub fn current_user(&self) -> Option<AuthUser> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Register an auth-state listener. Fires immediately with the current
    /// state, then on every sign-in and sign-out.
    pub fn subscribe(&self, listener: Listener) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let current = self.current_user();
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listener(current.as_ref());
        listeners.push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|(lid, _)| *lid != id);
    }

    fn set_current(&self, user: Option<AuthUser>) {
        {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            *current = user.clone();
        }
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        for (_, listener) in listeners.iter() {
            listener(user.as_ref());
        }
    }

    // -----------------------------------------------------------------------
    // Throttling
    // -----------------------------------------------------------------------

    fn check_throttle(&self, email: &str) -> Result<()> {
        let throttle = self.throttle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = throttle.get(email) {
            if entry.failures >= RATE_LIMIT_ATTEMPTS
                && entry.last_failure.elapsed() < RATE_LIMIT_WINDOW
            {
                warn!(email = %email, failures = entry.failures, "sign-in throttled");
                return Err(Error::RateLimited);
            }
        }
        Ok(())
    }

    fn record_failure(&self, email: &str) {
        let mut throttle = self.throttle.lock().unwrap_or_else(|e| e.into_inner());
        let entry = throttle.entry(email.to_string()).or_insert(ThrottleEntry {
            failures: 0,
            last_failure: Instant::now(),
        });
        if entry.last_failure.elapsed() >= RATE_LIMIT_WINDOW {
            entry.failures = 0;
        }
        entry.failures += 1;
        entry.last_failure = Instant::now();
    }

    fn clear_throttle(&self, email: &str) {
        let mut throttle = self.throttle.lock().unwrap_or_else(|e| e.into_inner());
        throttle.remove(email);
    }
}

fn normalize_email(email: &str) -> Result<String> {
    let trimmed = email.trim();
    if trimmed.is_empty() || !trimmed.contains('@') {
        return Err(Error::Validation("Invalid email address".into()));
    }
    Ok(trimmed.to_ascii_lowercase())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn store() -> CredentialStore {
        CredentialStore::new(Arc::new(db::test_state()))
    }

    #[test]
    fn sign_up_then_sign_in_roundtrip() {
        let creds = store();
        let created = creds.sign_up("owner@shop.test", "pw").expect("sign up");
        assert!(creds.current_user().is_none(), "sign-up must not sign in");

        let user = creds.sign_in("owner@shop.test", "pw").expect("sign in");
        assert_eq!(user.uid, created.uid);
        assert_eq!(creds.current_user(), Some(user));
    }

    #[test]
    fn duplicate_email_is_rejected() {
        let creds = store();
        creds.sign_up("dup@shop.test", "pw").expect("first");
        let err = creds.sign_up("dup@shop.test", "pw2").unwrap_err();
        assert!(matches!(err, Error::EmailInUse(_)));
    }

    #[test]
    fn wrong_password_and_unknown_user_are_indistinguishable() {
        let creds = store();
        creds.sign_up("a@shop.test", "pw").expect("sign up");
        assert!(matches!(
            creds.sign_in("a@shop.test", "nope").unwrap_err(),
            Error::InvalidCredentials
        ));
        assert!(matches!(
            creds.sign_in("ghost@shop.test", "pw").unwrap_err(),
            Error::InvalidCredentials
        ));
    }

    #[test]
    fn revoked_identity_cannot_sign_in() {
        let creds = store();
        let user = creds.sign_up("gone@shop.test", "pw").expect("sign up");
        creds.revoke(&user.uid).expect("revoke");
        assert!(matches!(
            creds.sign_in("gone@shop.test", "pw").unwrap_err(),
            Error::Revoked
        ));
    }

    #[test]
    fn throttle_kicks_in_after_repeated_failures() {
        let creds = store();
        creds.sign_up("rl@shop.test", "pw").expect("sign up");
        for _ in 0..RATE_LIMIT_ATTEMPTS {
            let err = creds.sign_in("rl@shop.test", "bad").unwrap_err();
            assert!(matches!(err, Error::InvalidCredentials));
        }
        // Even the correct password is throttled inside the window.
        assert!(matches!(
            creds.sign_in("rl@shop.test", "pw").unwrap_err(),
            Error::RateLimited
        ));
    }

    #[test]
    fn federated_sign_in_provisions_once() {
        let creds = store();
        let profile = FederatedProfile {
            email: "g@shop.test".into(),
            display_name: Some("G".into()),
            photo_url: None,
        };
        let first = creds.sign_in_federated(&profile).expect("first");
        creds.sign_out();
        let second = creds.sign_in_federated(&profile).expect("second");
        assert_eq!(first.uid, second.uid);
    }

    #[test]
    fn subscribe_fires_immediately_and_on_changes() {
        let creds = Arc::new(store());
        creds.sign_up("s@shop.test", "pw").expect("sign up");

        let events: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let id = creds.subscribe(Box::new(move |user| {
            sink.lock()
                .expect("events lock")
                .push(user.map(|u| u.email.clone()));
        }));

        creds.sign_in("s@shop.test", "pw").expect("sign in");
        creds.sign_out();
        creds.unsubscribe(id);
        creds.sign_in("s@shop.test", "pw").expect("after unsubscribe");

        let seen = events.lock().expect("events lock").clone();
        assert_eq!(
            seen,
            vec![None, Some("s@shop.test".to_string()), None],
            "initial fire, sign-in, sign-out; nothing after unsubscribe"
        );
    }
}
