//! UID-scoped advisory lock naming (§4.6, C6).
//!
//! The lock name itself is computed here so every [`crate::store::UidLockStore`]
//! implementation hashes the exact same string; only the transaction-scoped
//! `pg_advisory_xact_lock` call lives behind the trait.

/// `format!("ImplicitUIDLock:{:x}", md5::compute(uid))` — ported verbatim
/// from the original source's
/// `"ImplicitUIDLock:%s" % hashlib.md5(uid.encode()).hexdigest()`.
pub fn uid_lock_name(uid: &str) -> String {
    format!("ImplicitUIDLock:{:x}", md5::compute(uid.as_bytes()))
}

/// Fold the lock name into the 64-bit key `pg_advisory_xact_lock` takes.
/// Any stable hash works here; we reuse the md5 digest's leading bytes
/// rather than pull in a second hashing crate.
pub fn advisory_key(uid: &str) -> i64 {
    let digest = md5::compute(uid_lock_name(uid).as_bytes());
    i64::from_be_bytes(digest.0[..8].try_into().unwrap())
}
