//! Run-level lease preventing overlapping pipeline runs.

use crate::db::{DbError, LeaseRepository};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Held lease on a job name. Released when dropped.
pub struct LeaseGuard<'a, S: LeaseRepository> {
    store: &'a S,
    job: String,
    holder: String,
}

impl<'a, S: LeaseRepository> LeaseGuard<'a, S> {
    /// Try to take the lease for `job`. Returns `None` if another holder
    /// has an unexpired claim.
    pub fn acquire(
        store: &'a S,
        job: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: ChronoDuration,
    ) -> Result<Option<Self>, DbError> {
        if !store.try_acquire_lease(job, holder, now, now + ttl)? {
            return Ok(None);
        }

        tracing::debug!("Lease: {} acquired {}", holder, job);
        Ok(Some(Self {
            store,
            job: job.to_string(),
            holder: holder.to_string(),
        }))
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl<S: LeaseRepository> Drop for LeaseGuard<'_, S> {
    fn drop(&mut self) {
        // The TTL frees the lease eventually if this fails
        if let Err(e) = self.store.release_lease(&self.job, &self.holder) {
            tracing::error!("Lease: failed to release {} for {}: {}", self.job, self.holder, e);
        } else {
            tracing::debug!("Lease: {} released {}", self.holder, self.job);
        }
    }
}
