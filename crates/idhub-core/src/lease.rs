// Lease rules. Stores call these inside their own atomic section; nothing
// here touches storage.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::clock::expiry_after;
use crate::entity::Lease;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("leased by {holder} until {expires_at}")]
pub struct LeaseConflict {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl From<&Lease> for LeaseConflict {
    fn from(lease: &Lease) -> Self {
        Self {
            holder: lease.owner.clone(),
            expires_at: lease.expires_at,
        }
    }
}

/// Who performs a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller<'a> {
    /// Holder of the lease token.
    LeaseOwner(&'a str),
    /// Administrative write outside any claim; only allowed while unleased.
    Admin,
}

/// Grants or renews a lease for `owner`, expiring `duration` after `now`.
pub fn try_acquire(
    current: Option<&Lease>,
    owner: &str,
    duration: Duration,
    now: DateTime<Utc>,
) -> Result<Lease, LeaseConflict> {
    match current {
        Some(lease) if lease.is_active_at(now) && lease.owner != owner => Err(lease.into()),
        _ => Ok(Lease {
            owner: owner.to_string(),
            expires_at: expiry_after(now, duration),
        }),
    }
}

/// Checks that `caller` may clear `current`. An expired lease has no owner,
/// so anyone may clear it.
pub fn release(
    current: Option<&Lease>,
    caller: &str,
    now: DateTime<Utc>,
) -> Result<(), LeaseConflict> {
    match current {
        Some(lease) if lease.is_active_at(now) && lease.owner != caller => Err(lease.into()),
        _ => Ok(()),
    }
}

/// Checks that `caller` may write an entity currently holding `current`.
pub fn authorize_write(
    current: Option<&Lease>,
    caller: Caller<'_>,
    now: DateTime<Utc>,
) -> Result<(), Option<LeaseConflict>> {
    let active = current.filter(|lease| lease.is_active_at(now));
    match (caller, active) {
        (Caller::Admin, None) => Ok(()),
        (Caller::Admin, Some(lease)) => Err(Some(lease.into())),
        (Caller::LeaseOwner(owner), Some(lease)) if lease.owner == owner => Ok(()),
        (Caller::LeaseOwner(_), Some(lease)) => Err(Some(lease.into())),
        // The caller's lease expired; it no longer owns the entity.
        (Caller::LeaseOwner(_), None) => Err(None),
    }
}

pub fn is_free(current: Option<&Lease>, now: DateTime<Utc>) -> bool {
    current.is_none_or(|lease| !lease.is_active_at(now))
}

pub fn is_held_by(current: Option<&Lease>, owner: &str, now: DateTime<Utc>) -> bool {
    current.is_some_and(|lease| lease.is_held_by(owner, now))
}
