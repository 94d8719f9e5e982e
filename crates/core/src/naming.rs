//! Deterministic replica identities.

use crate::kind::Role;

pub const SEPARATOR: char = '-';

/// `"{role}-{job}-{uid}"`, lower cased.
///
/// Roles never contain the separator and the uid is always the last segment,
/// so the triple can be recovered from the name; no replica-id table is needed.
pub fn replica_name(role: Role, job_name: &str, uid: u32) -> String {
    format!("{}{SEPARATOR}{}{SEPARATOR}{}", role.as_str(), job_name, uid).to_lowercase()
}

/// Inverse of [`replica_name`] for names produced by it.
pub fn split_replica_name(name: &str) -> Option<(Role, &str, u32)> {
    let (role, rest) = name.split_once(SEPARATOR)?;
    let (job, uid) = rest.rsplit_once(SEPARATOR)?;
    if job.is_empty() { return None; }
    Some((Role::parse(role)?, job, uid.parse().ok()?))
}
