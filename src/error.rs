//! Error taxonomy shared across the crate.
//!
//! Every variant's `Display` output is a message suitable for direct display
//! in the frontend, so the UI layer can surface errors without re-mapping.
//! Validation and permission checks fail before any store call; store and
//! credential failures are re-raised to the caller unchanged, except for the
//! login-lockout flow (see `session::login`), which may replace an
//! invalid-credential error with [`Error::AccountLocked`].

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Local validation failure (password policy, required fields).
    /// Raised before any credential or store call is made.
    #[error("{0}")]
    Validation(String),

    /// A role-gated mutation was attempted by an unauthorized role.
    #[error("{0}")]
    Forbidden(&'static str),

    /// A referenced shop/branch/staff/account record does not exist.
    #[error("{0}")]
    NotFound(&'static str),

    /// An account (owner, guest, or staff) already exists for the email.
    #[error("{0}")]
    EmailInUse(&'static str),

    /// No shop is available to scope the operation against.
    #[error("No shop available for branches")]
    NoShop,

    /// The main branch (id == primary shop id) can never be deleted.
    #[error("Cannot delete the main branch")]
    CannotDeleteDefault,

    /// An operation that requires a signed-in principal found none.
    #[error("No user logged in")]
    NoUser,

    /// Too many consecutive failed logins; the shop account has been locked.
    #[error("Account locked due to too many failed login attempts. Please contact an administrator.")]
    AccountLocked,

    /// Email/password pair did not match a sign-in-capable account.
    #[error("Invalid email or password")]
    InvalidCredentials,

    /// The credential store is throttling this principal. Never intercepted
    /// by bookkeeping flows; always re-raised verbatim.
    #[error("Too many attempts. Please try again later.")]
    RateLimited,

    /// The credential identity was revoked. Distinct from
    /// [`Error::InvalidCredentials`] so the lockout flow never counts it.
    #[error("This account has been disabled")]
    Revoked,

    /// A guest login resolved to an account that is not a guest account.
    #[error("This account is not a guest account")]
    NotAGuestAccount,

    /// Optimistic-concurrency retries were exhausted.
    #[error("{0}")]
    Conflict(&'static str),

    /// Opaque failure surfaced by the document store.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Opaque failure surfaced by the password hasher.
    #[error("credential error: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}
