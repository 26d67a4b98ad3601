use std::collections::HashMap;
use std::collections::HashSet;
use thiserror::Error;

/// Opaque lock name; compared byte-exact.
pub type Key = Vec<u8>;

/// Opaque client identity; compared byte-exact.
pub type ClientId = Vec<u8>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LockError {
    /// The client already has an unanswered spot in a waiting set.
    #[error("client is already waiting for this lock")]
    AlreadyWaiting,
    /// A holder tried to re-enter the lock in the other mode.
    #[error("cannot re-enter the lock in a different mode")]
    InvalidReentry,
    /// Release by a client that neither reads nor writes the lock.
    #[error("lock not held")]
    NotHeld,
}

/// A reentrant readers-writer lock shared by remote clients.
///
/// Writers have priority: once a writer is waiting, new readers queue behind
/// it, but clients that already read the lock may still re-enter. A reader
/// may never upgrade to a writer, and a writer may never downgrade to a
/// reader; both directions report [`LockError::InvalidReentry`].
///
/// The server keeps a `Lock` in its active table only while at least one
/// client holds or waits for it; [`is_idle`](Lock::is_idle) tells the server
/// when to sweep it.
#[derive(Debug, Default)]
pub struct Lock {
    readers: HashMap<ClientId, u32>,
    writer: Option<ClientId>,
    writer_reentry: u32,
    waiting_readers: HashSet<ClientId>,
    waiting_writers: HashSet<ClientId>,
}

impl Lock {
    /// Attempt to acquire or re-enter the lock for `client_id`.
    ///
    /// Returns `true` when the lock is held on return. Returns `false` when
    /// the client was added to the matching waiting set; it will surface in
    /// the set returned by some later [`release`](Lock::release).
    pub fn acquire(&mut self, client_id: &[u8], read_only: bool) -> Result<bool, LockError> {
        if self.waiting_readers.contains(client_id) || self.waiting_writers.contains(client_id) {
            return Err(LockError::AlreadyWaiting);
        }
        if read_only {
            if let Some(writer) = &self.writer {
                if writer.as_slice() == client_id {
                    return Err(LockError::InvalidReentry);
                }
                // Readers wait while a writer holds the lock.
                self.waiting_readers.insert(client_id.to_vec());
                return Ok(false);
            }
            if !self.waiting_writers.is_empty() {
                // Writer priority: an existing reader may re-enter, but a new
                // reader queues behind the waiting writers.
                return Ok(match self.readers.get_mut(client_id) {
                    Some(level) => {
                        *level += 1;
                        true
                    }
                    None => {
                        self.waiting_readers.insert(client_id.to_vec());
                        false
                    }
                });
            }
            *self.readers.entry(client_id.to_vec()).or_insert(0) += 1;
            Ok(true)
        } else {
            if self.readers.contains_key(client_id) {
                return Err(LockError::InvalidReentry);
            }
            let writer_slot_free = match &self.writer {
                None => true,
                Some(writer) => writer.as_slice() == client_id,
            };
            if writer_slot_free && self.readers.is_empty() {
                self.writer = Some(client_id.to_vec());
                self.writer_reentry += 1;
                Ok(true)
            } else {
                self.waiting_writers.insert(client_id.to_vec());
                Ok(false)
            }
        }
    }

    /// Drop one reentry level for `client_id`, or every level when `fully`
    /// is set. If this frees the lock, waiting clients are promoted: one
    /// waiting writer wins over any number of waiting readers; with no
    /// writer waiting, all waiting readers acquire at once. Returns the set
    /// of clients that acquired the lock as a result.
    pub fn release(
        &mut self,
        client_id: &[u8],
        fully: bool,
    ) -> Result<HashSet<ClientId>, LockError> {
        if let Some(level) = self.readers.get_mut(client_id) {
            *level -= 1;
            if *level == 0 || fully {
                self.readers.remove(client_id);
            }
            if self.readers.is_empty() {
                if let Some(next) = self.pop_waiting_writer() {
                    self.writer = Some(next.clone());
                    self.writer_reentry = 1;
                    return Ok(HashSet::from([next]));
                }
            }
            Ok(HashSet::new())
        } else if self.writer.as_deref() == Some(client_id) {
            self.writer_reentry -= 1;
            if self.writer_reentry > 0 && !fully {
                // Still re-entered; nothing to hand over yet.
                return Ok(HashSet::new());
            }
            self.writer = None;
            self.writer_reentry = 0;
            if let Some(next) = self.pop_waiting_writer() {
                self.writer = Some(next.clone());
                self.writer_reentry = 1;
                return Ok(HashSet::from([next]));
            }
            if !self.waiting_readers.is_empty() {
                for reader in &self.waiting_readers {
                    self.readers.insert(reader.clone(), 1);
                }
                return Ok(std::mem::take(&mut self.waiting_readers));
            }
            Ok(HashSet::new())
        } else {
            Err(LockError::NotHeld)
        }
    }

    /// Remove `client_id` from whichever waiting set contains it. Never an
    /// error; a client that is not waiting is left alone.
    pub fn give_up(&mut self, client_id: &[u8]) {
        if !self.waiting_readers.remove(client_id) {
            self.waiting_writers.remove(client_id);
        }
    }

    /// Whether nobody holds or waits for the lock. An idle lock has no
    /// reason to exist and is swept from the server's active table.
    pub fn is_idle(&self) -> bool {
        self.readers.is_empty()
            && self.writer.is_none()
            && self.waiting_readers.is_empty()
            && self.waiting_writers.is_empty()
    }

    /// Whether `client_id` currently holds the lock in either mode.
    pub fn is_held_by(&self, client_id: &[u8]) -> bool {
        self.readers.contains_key(client_id) || self.writer.as_deref() == Some(client_id)
    }

    fn pop_waiting_writer(&mut self) -> Option<ClientId> {
        // Selection among waiting writers is deliberately unordered.
        let next = self.waiting_writers.iter().next().cloned()?;
        self.waiting_writers.remove(&next);
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn granted(result: Result<bool, LockError>) -> bool {
        result.expect("acquire should not error")
    }

    /// No client id may appear in more than one membership set, and a held
    /// writer excludes any readers.
    fn assert_membership_invariants(lock: &Lock) {
        if lock.writer.is_some() {
            assert!(lock.readers.is_empty());
        }
        let mut seen: Vec<&ClientId> = lock.readers.keys().collect();
        seen.extend(lock.writer.iter());
        seen.extend(lock.waiting_readers.iter());
        seen.extend(lock.waiting_writers.iter());
        let total = seen.len();
        let distinct: HashSet<&ClientId> = seen.into_iter().collect();
        assert_eq!(distinct.len(), total);
    }

    #[test]
    fn writer_acquires_and_reenters() {
        let mut lock = Lock::default();
        assert!(granted(lock.acquire(b"c1", false)));
        assert!(granted(lock.acquire(b"c1", false)));
        assert_membership_invariants(&lock);

        assert!(lock.release(b"c1", false).unwrap().is_empty());
        assert!(lock.is_held_by(b"c1"));
        assert!(lock.release(b"c1", false).unwrap().is_empty());
        assert!(lock.is_idle());
    }

    #[test]
    fn reader_acquires_and_reenters() {
        let mut lock = Lock::default();
        assert!(granted(lock.acquire(b"c1", true)));
        assert!(granted(lock.acquire(b"c1", true)));

        assert!(lock.release(b"c1", false).unwrap().is_empty());
        assert!(lock.is_held_by(b"c1"));
        assert!(lock.release(b"c1", false).unwrap().is_empty());
        assert!(lock.is_idle());
    }

    #[test]
    fn readers_share_the_lock() {
        let mut lock = Lock::default();
        assert!(granted(lock.acquire(b"c1", true)));
        assert!(granted(lock.acquire(b"c2", true)));
        assert_membership_invariants(&lock);
    }

    #[test]
    fn reader_upgrade_is_invalid_reentry() {
        let mut lock = Lock::default();
        assert!(granted(lock.acquire(b"c1", true)));
        assert_eq!(lock.acquire(b"c1", false), Err(LockError::InvalidReentry));
        // State unchanged: the read hold is still releasable.
        assert!(lock.release(b"c1", false).unwrap().is_empty());
        assert!(lock.is_idle());
    }

    #[test]
    fn writer_downgrade_is_invalid_reentry() {
        let mut lock = Lock::default();
        assert!(granted(lock.acquire(b"c1", false)));
        assert_eq!(lock.acquire(b"c1", true), Err(LockError::InvalidReentry));
        assert!(lock.is_held_by(b"c1"));
        assert_membership_invariants(&lock);
    }

    #[test]
    fn waiting_twice_is_rejected() {
        let mut lock = Lock::default();
        assert!(granted(lock.acquire(b"c1", false)));
        assert!(!granted(lock.acquire(b"c2", false)));
        assert_eq!(lock.acquire(b"c2", false), Err(LockError::AlreadyWaiting));
        assert_eq!(lock.acquire(b"c2", true), Err(LockError::AlreadyWaiting));
    }

    #[test]
    fn new_reader_queues_behind_waiting_writer() {
        let mut lock = Lock::default();
        assert!(granted(lock.acquire(b"c1", true)));
        assert!(!granted(lock.acquire(b"c2", false)));
        // c3 must queue behind the writer, but c1 may still re-enter.
        assert!(!granted(lock.acquire(b"c3", true)));
        assert!(granted(lock.acquire(b"c1", true)));
        assert_membership_invariants(&lock);
    }

    #[test]
    fn reader_release_promotes_one_writer() {
        let mut lock = Lock::default();
        assert!(granted(lock.acquire(b"c1", true)));
        assert!(!granted(lock.acquire(b"c2", false)));

        let acquired = lock.release(b"c1", false).unwrap();
        assert_eq!(acquired, HashSet::from([b"c2".to_vec()]));
        assert!(lock.is_held_by(b"c2"));
        assert_membership_invariants(&lock);
    }

    #[test]
    fn writer_release_prefers_waiting_writer_over_readers() {
        let mut lock = Lock::default();
        assert!(granted(lock.acquire(b"c1", false)));
        assert!(!granted(lock.acquire(b"c2", false)));
        assert!(!granted(lock.acquire(b"c3", true)));

        let acquired = lock.release(b"c1", false).unwrap();
        assert_eq!(acquired, HashSet::from([b"c2".to_vec()]));
        // The reader is still queued behind the new writer.
        assert!(!lock.is_held_by(b"c3"));
        assert_membership_invariants(&lock);
    }

    #[test]
    fn writer_release_grants_all_waiting_readers_at_once() {
        let mut lock = Lock::default();
        assert!(granted(lock.acquire(b"c1", false)));
        assert!(!granted(lock.acquire(b"c2", true)));
        assert!(!granted(lock.acquire(b"c3", true)));

        let acquired = lock.release(b"c1", false).unwrap();
        assert_eq!(acquired, HashSet::from([b"c2".to_vec(), b"c3".to_vec()]));
        assert!(lock.is_held_by(b"c2"));
        assert!(lock.is_held_by(b"c3"));
        assert_membership_invariants(&lock);
    }

    #[test]
    fn reentered_writer_keeps_the_lock_until_fully_drained() {
        let mut lock = Lock::default();
        assert!(granted(lock.acquire(b"c1", false)));
        assert!(granted(lock.acquire(b"c1", false)));
        assert!(!granted(lock.acquire(b"c2", false)));

        // One release leaves a reentry level; nobody may be promoted.
        assert!(lock.release(b"c1", false).unwrap().is_empty());
        assert!(lock.is_held_by(b"c1"));
        assert_membership_invariants(&lock);

        let acquired = lock.release(b"c1", false).unwrap();
        assert_eq!(acquired, HashSet::from([b"c2".to_vec()]));
    }

    #[test]
    fn fully_release_matches_repeated_release() {
        let mut lock = Lock::default();
        for _ in 0..3 {
            assert!(granted(lock.acquire(b"c1", false)));
        }
        assert!(!granted(lock.acquire(b"c2", false)));

        let acquired = lock.release(b"c1", true).unwrap();
        assert_eq!(acquired, HashSet::from([b"c2".to_vec()]));
    }

    #[test]
    fn release_by_non_holder_is_not_held() {
        let mut lock = Lock::default();
        assert!(granted(lock.acquire(b"c1", false)));
        assert_eq!(lock.release(b"c2", false), Err(LockError::NotHeld));
        // A waiter is not a holder either.
        assert!(!granted(lock.acquire(b"c3", false)));
        assert_eq!(lock.release(b"c3", false), Err(LockError::NotHeld));
    }

    #[test]
    fn give_up_then_fresh_acquire_is_legal() {
        let mut lock = Lock::default();
        assert!(granted(lock.acquire(b"c1", false)));
        assert!(!granted(lock.acquire(b"c2", false)));

        lock.give_up(b"c2");
        assert!(!granted(lock.acquire(b"c2", false)));
        assert_membership_invariants(&lock);
    }

    #[test]
    fn give_up_for_unknown_client_is_noop() {
        let mut lock = Lock::default();
        assert!(granted(lock.acquire(b"c1", true)));
        lock.give_up(b"nobody");
        assert!(lock.is_held_by(b"c1"));
    }

    #[test]
    fn lock_returns_to_idle_after_balanced_releases() {
        let mut lock = Lock::default();
        for _ in 0..4 {
            assert!(granted(lock.acquire(b"c1", true)));
        }
        for _ in 0..4 {
            assert!(lock.release(b"c1", false).unwrap().is_empty());
        }
        assert!(lock.is_idle());
    }
}
