//! Shopkeeper: the account, session, and scoping backbone of a multi-branch
//! retail back office.
//!
//! Three concerns live here. The session layer resolves a signed-in
//! credential into a role (owner, staff, or guest) plus the profile data
//! that goes with it. The branch layer maintains which branch of the shop
//! the user is operating as, including the persisted per-shop preference
//! and the self-healed default branch. The invoice layer hands out gap-free
//! per-shop invoice numbers under concurrent allocation.
//!
//! [`ShopContext`] ties the three together into the single surface a
//! frontend binds to.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod branches;
mod context;
mod credentials;
mod db;
mod error;
mod invoices;
mod policy;
mod session;
mod staff;

pub use branches::{Branch, BranchManager, BranchState, DEFAULT_BRANCH_NAME};
pub use context::{ContextSnapshot, ShopContext};
pub use credentials::{AuthUser, CredentialStore, FederatedProfile, SubscriptionId};
pub use db::DbState;
pub use error::{Error, Result};
pub use invoices::{allocate as allocate_invoice_number, legacy_token};
pub use session::{
    GuestPermissions, Role, SessionService, SessionState, ShopDetails, ShopPatch, ShopRecord,
};
pub use staff::{NewStaff, StaffPermissions, StaffRecord};

/// Open (or create) the database under `data_dir` and run migrations.
pub fn init_db(data_dir: &std::path::Path) -> Result<DbState> {
    db::init(data_dir)
}

/// Open a database through a SQLite URI (e.g. `file::memory:?cache=shared`)
/// and run migrations.
pub fn init_db_uri(uri: &str) -> Result<DbState> {
    db::init_uri(uri)
}

/// Initialize structured logging. `RUST_LOG` overrides the default filter.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,shopkeeper=debug"));

    let console_layer = fmt::layer().with_target(true);
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .try_init();
}
