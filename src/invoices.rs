//! Sequential invoice numbering.
//!
//! Each shop carries a `next_invoice_number` counter on its profile row.
//! Allocation is an explicit compare-and-swap loop over the counter and a
//! version column: read both, compute the successor, and commit only if the
//! version is unchanged. Two racing allocations for the same shop can never
//! both commit the same number; the loser retries with backoff and
//! surfaces [`Error::Conflict`] only when retries are exhausted.
//!
//! The connection lock is released between the read and the write on
//! purpose: correctness comes from the version check, not from holding the
//! store for the whole operation, matching how a remote document store's
//! transaction primitive behaves.

use rusqlite::{params, Connection, OptionalExtension};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{Error, Result};

/// CAS attempts before giving up.
const MAX_ATTEMPTS: u32 = 5;
/// First retry backoff; doubles per attempt.
const BASE_BACKOFF_MS: u64 = 5;

/// Allocate the next invoice number for a shop.
///
/// The first allocation for a shop (counter absent or zero) returns `"1"`;
/// each successful allocation thereafter returns the next integer with no
/// gaps. A missing shop profile is created with its counter initialized,
/// mirroring the merge-write the hosted store performed.
pub fn allocate(db: &DbState, shop_id: &str) -> Result<String> {
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let backoff = BASE_BACKOFF_MS << (attempt - 1);
            std::thread::sleep(Duration::from_millis(backoff));
        }

        let current = {
            let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
            read_counter(&conn, shop_id)?
        };

        match current {
            None => {
                // No profile yet: claim number 1 by creating the row.
                let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
                let inserted = conn.execute(
                    "INSERT INTO shops (id, next_invoice_number, invoice_counter_version)
                     VALUES (?1, 1, 1)
                     ON CONFLICT(id) DO NOTHING",
                    params![shop_id],
                )?;
                if inserted == 1 {
                    return Ok("1".to_string());
                }
                // Someone else created the row first; re-read.
                debug!(shop_id = %shop_id, attempt, "lost race creating counter row, retrying");
            }
            Some((number, version)) => {
                let next = number + 1;
                let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
                if cas_write(&conn, shop_id, next, version)? {
                    return Ok(next.to_string());
                }
                debug!(shop_id = %shop_id, attempt, "invoice counter conflict, retrying");
            }
        }
    }

    warn!(shop_id = %shop_id, attempts = MAX_ATTEMPTS, "invoice allocation retries exhausted");
    Err(Error::Conflict(
        "Could not allocate an invoice number, please try again",
    ))
}

/// Legacy non-sequential mode for call sites that do not yet scope
/// invoices per shop: an 8-character uppercase token with no ordering
/// guarantee and no stored state.
pub fn legacy_token() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_uppercase()
}

fn read_counter(conn: &Connection, shop_id: &str) -> Result<Option<(i64, i64)>> {
    let row = conn
        .query_row(
            "SELECT next_invoice_number, invoice_counter_version FROM shops WHERE id = ?1",
            params![shop_id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;
    Ok(row)
}

/// Commit `next` only if nobody advanced the counter since `expected_version`
/// was read. Returns whether the write landed.
fn cas_write(conn: &Connection, shop_id: &str, next: i64, expected_version: i64) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE shops
         SET next_invoice_number = ?1, invoice_counter_version = invoice_counter_version + 1
         WHERE id = ?2 AND invoice_counter_version = ?3",
        params![next, shop_id, expected_version],
    )?;
    Ok(updated == 1)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::sync::Arc;

    #[test]
    fn first_allocation_returns_one_even_without_a_profile() {
        let state = db::test_state();
        assert_eq!(allocate(&state, "shop-a").expect("allocate"), "1");

        // The merge-write created the profile row.
        let conn = state.conn.lock().expect("db lock");
        let (number, _) = read_counter(&conn, "shop-a")
            .expect("read")
            .expect("row exists");
        assert_eq!(number, 1);
    }

    #[test]
    fn sequential_allocations_count_up_without_gaps() {
        let state = db::test_state();
        {
            let conn = state.conn.lock().expect("db lock");
            conn.execute("INSERT INTO shops (id) VALUES ('shop-a')", [])
                .expect("seed shop");
        }
        for expected in 1..=6 {
            assert_eq!(
                allocate(&state, "shop-a").expect("allocate"),
                expected.to_string()
            );
        }
    }

    #[test]
    fn counters_are_independent_per_shop() {
        let state = db::test_state();
        assert_eq!(allocate(&state, "shop-a").expect("a1"), "1");
        assert_eq!(allocate(&state, "shop-a").expect("a2"), "2");
        assert_eq!(allocate(&state, "shop-b").expect("b1"), "1");
    }

    #[test]
    fn resumes_from_an_existing_counter() {
        let state = db::test_state();
        {
            let conn = state.conn.lock().expect("db lock");
            conn.execute(
                "INSERT INTO shops (id, next_invoice_number, invoice_counter_version)
                 VALUES ('shop-a', 41, 7)",
                [],
            )
            .expect("seed counter");
        }
        assert_eq!(allocate(&state, "shop-a").expect("allocate"), "42");
    }

    #[test]
    fn cas_write_refuses_a_stale_version() {
        let state = db::test_state();
        {
            let conn = state.conn.lock().expect("db lock");
            conn.execute("INSERT INTO shops (id) VALUES ('shop-a')", [])
                .expect("seed shop");
        }
        let conn = state.conn.lock().expect("db lock");
        let (number, version) = read_counter(&conn, "shop-a")
            .expect("read")
            .expect("row exists");

        // Another writer advances the counter between read and write.
        assert!(cas_write(&conn, "shop-a", number + 1, version).expect("first writer"));
        assert!(
            !cas_write(&conn, "shop-a", number + 1, version).expect("second writer"),
            "stale version must not commit"
        );
        let (after, _) = read_counter(&conn, "shop-a")
            .expect("read")
            .expect("row exists");
        assert_eq!(after, number + 1, "no double increment");
    }

    #[test]
    fn concurrent_allocations_are_distinct_and_gap_free() {
        let state = Arc::new(db::test_state());
        const THREADS: usize = 8;
        const PER_THREAD: usize = 5;

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || {
                    let mut numbers = Vec::with_capacity(PER_THREAD);
                    for _ in 0..PER_THREAD {
                        numbers.push(
                            allocate(&state, "shop-a")
                                .expect("allocation should succeed under contention")
                                .parse::<i64>()
                                .expect("numeric"),
                        );
                    }
                    numbers
                })
            })
            .collect();

        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread join"))
            .collect();
        all.sort_unstable();

        let expected: Vec<i64> = (1..=(THREADS * PER_THREAD) as i64).collect();
        assert_eq!(all, expected, "no duplicates, no gaps");
    }

    #[test]
    fn legacy_tokens_are_short_uppercase_and_unordered() {
        let a = legacy_token();
        let b = legacy_token();
        assert_eq!(a.len(), 8);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        assert_ne!(a, b, "tokens are effectively unique");
    }
}
