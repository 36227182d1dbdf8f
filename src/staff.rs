//! Staff account management.
//!
//! Owners delegate a bounded capability set to staff members. A staff
//! record is keyed by the staff member's own credential id and points back
//! at the owning shop via `shop_id`. Removing the record only removes the
//! authorization; revoking the underlying credential identity is a
//! separate, composable step (`revoke_staff_credential`).

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::credentials::CredentialStore;
use crate::db::DbState;
use crate::error::{Error, Result};
use crate::policy;
use crate::session::Role;

/// The ten boolean capabilities an owner can grant a staff member.
/// Field names match the document keys the frontend stores and reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StaffPermissions {
    pub can_view_receipts: bool,
    pub can_create_receipts: bool,
    pub can_edit_receipts: bool,
    pub can_delete_receipts: bool,
    pub can_view_stock: bool,
    pub can_edit_stock: bool,
    pub can_view_employees: bool,
    pub can_mark_attendance: bool,
    pub can_view_analytics: bool,
    pub can_manage_expenses: bool,
}

/// A staff document.
#[derive(Debug, Clone, Serialize)]
pub struct StaffRecord {
    pub id: String,
    pub shop_id: String,
    pub name: String,
    pub email: String,
    pub permissions: StaffPermissions,
    pub status: String,
    pub account_type: String,
    pub created_at: String,
    pub updated_at: Option<String>,
}

/// Request payload for creating a staff account.
#[derive(Debug, Clone)]
pub struct NewStaff {
    pub name: String,
    pub email: String,
    pub password: String,
    pub permissions: StaffPermissions,
}

fn require_owner(role: Role) -> Result<()> {
    if role != Role::Owner {
        return Err(Error::Forbidden("Only shop owners can manage staff"));
    }
    Ok(())
}

fn row_to_staff(row: &Row<'_>) -> rusqlite::Result<StaffRecord> {
    let permissions_json: String = row.get(4)?;
    Ok(StaffRecord {
        id: row.get(0)?,
        shop_id: row.get(1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        permissions: serde_json::from_str(&permissions_json).unwrap_or_default(),
        status: row.get(5)?,
        account_type: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

const STAFF_COLUMNS: &str =
    "id, shop_id, name, email, permissions, status, account_type, created_at, updated_at";

/// Fetch a staff record by principal id. Used by the session resolver,
/// which already holds the connection lock.
pub fn get_staff(conn: &Connection, id: &str) -> Result<Option<StaffRecord>> {
    let record = conn
        .query_row(
            &format!("SELECT {STAFF_COLUMNS} FROM staff WHERE id = ?1"),
            params![id],
            row_to_staff,
        )
        .optional()?;
    Ok(record)
}

/// List all staff records for a shop.
pub fn list_staff(db: &DbState, shop_id: &str) -> Result<Vec<StaffRecord>> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let mut stmt = conn.prepare(&format!(
        "SELECT {STAFF_COLUMNS} FROM staff WHERE shop_id = ?1 ORDER BY created_at"
    ))?;
    let rows = stmt.query_map(params![shop_id], row_to_staff)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Create a staff account: a fresh credential identity plus a staff
/// document keyed by it. Owner-only. The new identity is not signed in.
pub fn create_staff(
    db: &DbState,
    credentials: &CredentialStore,
    role: Role,
    owner_id: &str,
    req: &NewStaff,
) -> Result<StaffRecord> {
    require_owner(role)?;

    let name = req.name.trim();
    if name.is_empty() {
        return Err(Error::Validation("Staff name is required".into()));
    }
    policy::validate_password(&req.password)?;

    let email = req.email.trim().to_ascii_lowercase();
    {
        let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM staff WHERE email = ?1)
             OR EXISTS(SELECT 1 FROM shops WHERE user_email = ?1)",
            params![email],
            |row| row.get(0),
        )?;
        if taken {
            return Err(Error::EmailInUse("This email is already registered"));
        }
    }

    let user = credentials.sign_up(&email, &req.password)?;

    let record = StaffRecord {
        id: user.uid,
        shop_id: owner_id.to_string(),
        name: name.to_string(),
        email,
        permissions: req.permissions.clone(),
        status: "active".to_string(),
        account_type: "staff".to_string(),
        created_at: Utc::now().to_rfc3339(),
        updated_at: None,
    };

    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    conn.execute(
        "INSERT INTO staff (id, shop_id, name, email, permissions, status, account_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.id,
            record.shop_id,
            record.name,
            record.email,
            serde_json::to_string(&record.permissions).unwrap_or_else(|_| "{}".into()),
            record.status,
            record.account_type,
            record.created_at,
        ],
    )?;

    info!(staff_id = %record.id, shop_id = %record.shop_id, "staff account created");
    Ok(record)
}

/// Update a staff member's name and permission set. Owner-only.
pub fn update_staff(
    db: &DbState,
    role: Role,
    staff_id: &str,
    name: &str,
    permissions: &StaffPermissions,
) -> Result<()> {
    require_owner(role)?;

    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let updated = conn.execute(
        "UPDATE staff SET name = ?1, permissions = ?2, updated_at = ?3 WHERE id = ?4",
        params![
            name,
            serde_json::to_string(permissions).unwrap_or_else(|_| "{}".into()),
            Utc::now().to_rfc3339(),
            staff_id,
        ],
    )?;
    if updated == 0 {
        return Err(Error::NotFound("Staff member not found"));
    }
    Ok(())
}

/// Delete a staff record. Owner-only. Removes the authorization document
/// only; the credential identity stays sign-in-capable until
/// [`revoke_staff_credential`] is called.
pub fn delete_staff(db: &DbState, role: Role, staff_id: &str) -> Result<()> {
    require_owner(role)?;

    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let deleted = conn.execute("DELETE FROM staff WHERE id = ?1", params![staff_id])?;
    if deleted == 0 {
        return Err(Error::NotFound("Staff member not found"));
    }
    info!(staff_id = %staff_id, "staff record deleted (credential left intact)");
    Ok(())
}

/// Revoke a former staff member's credential identity. Owner-only.
pub fn revoke_staff_credential(
    credentials: &CredentialStore,
    role: Role,
    staff_id: &str,
) -> Result<()> {
    require_owner(role)?;
    credentials.revoke(staff_id)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::sync::Arc;

    fn fixture() -> (Arc<DbState>, CredentialStore) {
        let db = Arc::new(db::test_state());
        let creds = CredentialStore::new(Arc::clone(&db));
        (db, creds)
    }

    fn new_staff(email: &str) -> NewStaff {
        NewStaff {
            name: "Sam".into(),
            email: email.into(),
            password: "Str0ng!pass".into(),
            permissions: StaffPermissions {
                can_view_receipts: true,
                can_create_receipts: true,
                ..StaffPermissions::default()
            },
        }
    }

    #[test]
    fn create_then_fetch_staff() {
        let (db, creds) = fixture();
        let record = create_staff(&db, &creds, Role::Owner, "owner-1", &new_staff("s@x.test"))
            .expect("create staff");

        let conn = db.conn.lock().expect("db lock");
        let fetched = get_staff(&conn, &record.id).expect("fetch").expect("exists");
        assert_eq!(fetched.shop_id, "owner-1");
        assert_eq!(fetched.status, "active");
        assert_eq!(fetched.account_type, "staff");
        assert!(fetched.permissions.can_view_receipts);
        assert!(!fetched.permissions.can_delete_receipts);
    }

    #[test]
    fn non_owner_roles_are_forbidden() {
        let (db, creds) = fixture();
        for role in [Role::Staff, Role::Guest, Role::None] {
            let err = create_staff(&db, &creds, role, "owner-1", &new_staff("f@x.test"))
                .expect_err("gated");
            assert!(matches!(err, Error::Forbidden(_)), "role {role:?}");
        }
        assert!(matches!(
            delete_staff(&db, Role::Staff, "anything").unwrap_err(),
            Error::Forbidden(_)
        ));
        assert!(matches!(
            update_staff(
                &db,
                Role::Guest,
                "anything",
                "n",
                &StaffPermissions::default()
            )
            .unwrap_err(),
            Error::Forbidden(_)
        ));
    }

    #[test]
    fn duplicate_email_rejected_across_staff_and_shops() {
        let (db, creds) = fixture();
        {
            let conn = db.conn.lock().expect("db lock");
            conn.execute(
                "INSERT INTO shops (id, user_email) VALUES ('o1', 'owner@x.test')",
                [],
            )
            .expect("seed shop");
        }
        let err = create_staff(&db, &creds, Role::Owner, "o1", &new_staff("owner@x.test"))
            .expect_err("shop email taken");
        assert!(matches!(err, Error::EmailInUse(_)));

        create_staff(&db, &creds, Role::Owner, "o1", &new_staff("s1@x.test")).expect("first");
        let err = create_staff(&db, &creds, Role::Owner, "o1", &new_staff("s1@x.test"))
            .expect_err("staff email taken");
        assert!(matches!(err, Error::EmailInUse(_)));
    }

    #[test]
    fn weak_staff_password_fails_before_identity_creation() {
        let (db, creds) = fixture();
        let mut req = new_staff("weak@x.test");
        req.password = "short".into();
        let err =
            create_staff(&db, &creds, Role::Owner, "o1", &req).expect_err("policy violation");
        assert!(matches!(err, Error::Validation(_)));
        // No credential identity was provisioned.
        assert!(matches!(
            creds.sign_in("weak@x.test", "short").unwrap_err(),
            Error::InvalidCredentials
        ));
    }

    #[test]
    fn delete_leaves_credential_until_revoked() {
        let (db, creds) = fixture();
        let record = create_staff(&db, &creds, Role::Owner, "o1", &new_staff("leave@x.test"))
            .expect("create");

        delete_staff(&db, Role::Owner, &record.id).expect("delete");
        {
            let conn = db.conn.lock().expect("db lock");
            assert!(get_staff(&conn, &record.id).expect("fetch").is_none());
        }

        // Identity still signs in after the record is gone.
        creds
            .sign_in("leave@x.test", "Str0ng!pass")
            .expect("still sign-in-capable");
        creds.sign_out();

        revoke_staff_credential(&creds, Role::Owner, &record.id).expect("revoke");
        assert!(matches!(
            creds.sign_in("leave@x.test", "Str0ng!pass").unwrap_err(),
            Error::Revoked
        ));
    }

    #[test]
    fn update_staff_stamps_updated_at() {
        let (db, creds) = fixture();
        let record =
            create_staff(&db, &creds, Role::Owner, "o1", &new_staff("up@x.test")).expect("create");

        let mut perms = record.permissions.clone();
        perms.can_view_analytics = true;
        update_staff(&db, Role::Owner, &record.id, "Sam II", &perms).expect("update");

        let conn = db.conn.lock().expect("db lock");
        let fetched = get_staff(&conn, &record.id).expect("fetch").expect("exists");
        assert_eq!(fetched.name, "Sam II");
        assert!(fetched.permissions.can_view_analytics);
        assert!(fetched.updated_at.is_some());

        drop(conn);
        assert!(matches!(
            update_staff(&db, Role::Owner, "missing", "x", &StaffPermissions::default())
                .unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
