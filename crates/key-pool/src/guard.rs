//! Scoped working mark
//!
//! A `WorkingGuard` owns the working mark for one credential. Dropping it
//! releases the mark, which covers early returns, panics and cancellation of
//! the future holding it. A mark that was re-taken by another task in the
//! meantime is left alone.

use common::BearerToken;

use crate::pool::KeyPool;

/// Exclusive dispatch right on one credential.
#[must_use = "the working mark is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct WorkingGuard<'a> {
    pool: &'a KeyPool,
    token: BearerToken,
    task_id: String,
}

impl<'a> WorkingGuard<'a> {
    pub(crate) fn new(pool: &'a KeyPool, token: BearerToken, task_id: String) -> Self {
        Self {
            pool,
            token,
            task_id,
        }
    }

    pub fn token(&self) -> &BearerToken {
        &self.token
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Move the mark to a new task id without releasing it, e.g. from a
    /// placeholder to the id the upstream assigned.
    ///
    /// Returns false, keeping the old id, when the mark was swept and taken
    /// by another task in the meantime.
    pub fn rebind(&mut self, task_id: impl Into<String>) -> bool {
        let task_id = task_id.into();
        if !self
            .pool
            .rebind_if_owned(&self.token, &self.task_id, &task_id)
        {
            return false;
        }
        self.task_id = task_id;
        true
    }
}

impl Drop for WorkingGuard<'_> {
    fn drop(&mut self) {
        self.pool.release_if_owned(&self.token, &self.task_id);
    }
}
