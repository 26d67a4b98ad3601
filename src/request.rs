//! The per-(key, client) request state machine.
//!
//! Every ongoing relationship between a client and a named lock is tracked
//! by one [`LockRequest`]. Events (client frames and expiring timers) are
//! handled as explicit transitions on [`LockServer`]; each state owns the
//! single timer that may fire while it is current. The request never holds
//! references into the server's tables: timers carry the slot and the
//! engine re-resolves it when they fire.

use crate::lock::ClientId;
use crate::lock::Key;
use crate::lock::LockError;
use crate::server::reply;
use crate::server::LockServer;
use crate::tasks::TaskId;
use crate::transport::RoutingId;
use crate::wire;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

/// How long a client may go unanswered before being told to retry.
pub const MAX_RESPONSE_TIME: Duration = Duration::from_secs(1);

/// How long the server waits for an absent client to come back before
/// giving up (or releasing a lock granted in the meantime) on its behalf.
pub const MAX_ABSENT_TIME: Duration = Duration::from_secs(1);

/// Timer payloads scheduled by lock requests.
#[derive(Debug)]
pub(crate) enum TimerEvent {
    AdviseRetry { key: Key, client_id: ClientId },
    GiveUp { key: Key, client_id: ClientId },
    LeaseExpiry { key: Key, client_id: ClientId },
}

/// Where a request stands. A request that is done is removed from the
/// active table rather than parked in a terminal state; the initial state
/// is likewise virtual, since the first `acquire` immediately lands in one
/// of the variants below.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RequestState {
    /// Asked and not yet answered; the advise-retry timer is running.
    PresentWaiting { advise_retry: TaskId },
    /// Told to retry and not yet back; the give-up timer is running.
    AbsentWaiting { give_up: TaskId },
    /// Granted while absent; held on the client's behalf under the short
    /// absent lease until the client comes back to claim it.
    AbsentHeld { lease: TaskId },
    /// Held, and the client knows it. A re-entry may extend the lease
    /// deadline but never shorten it.
    Held { lease: TaskId, deadline: Instant },
}

/// One client's ongoing relationship with one named lock.
#[derive(Debug)]
pub(crate) struct LockRequest {
    /// Where replies go: the peer identity from the client's latest frame,
    /// so a client that reconnects keeps receiving answers.
    pub(crate) routing_id: RoutingId,
    /// The lease duration from the client's latest `acquire`.
    pub(crate) timeout: Duration,
    /// Whether the current attempt is for a shared hold.
    pub(crate) read_only: bool,
    pub(crate) state: RequestState,
}

impl LockServer {
    /// A client asked to acquire (or re-enter) a lock.
    pub(crate) fn acquire_request(
        &mut self,
        routing_id: RoutingId,
        key: Key,
        client_id: ClientId,
        timeout: Duration,
        read_only: bool,
    ) {
        let slot = (key, client_id);
        let snapshot = self
            .active_requests
            .get(&slot)
            .map(|request| (request.state, request.read_only));
        let Some((state, prev_read_only)) = snapshot else {
            let (key, client_id) = slot;
            self.initial_acquisition(routing_id, key, client_id, timeout, read_only);
            return;
        };

        match state {
            RequestState::Held { lease, deadline } => {
                let lock = self
                    .active_locks
                    .get_mut(&slot.0)
                    .expect("held request without an active lock");
                match lock.acquire(&slot.1, read_only) {
                    Ok(granted) => {
                        assert!(granted, "re-entry on a held lock was refused");
                        reply(&self.router, routing_id, wire::OK);
                        let new_deadline = Instant::now() + timeout;
                        let extend = new_deadline > deadline;
                        if extend {
                            self.tasks.cancel(lease);
                        }
                        let new_lease = extend.then(|| {
                            self.tasks.add(
                                timeout,
                                TimerEvent::LeaseExpiry {
                                    key: slot.0.clone(),
                                    client_id: slot.1.clone(),
                                },
                            )
                        });
                        let request = self
                            .active_requests
                            .get_mut(&slot)
                            .expect("request disappeared mid-transition");
                        request.routing_id = routing_id;
                        request.timeout = timeout;
                        if let Some(lease) = new_lease {
                            request.state = RequestState::Held {
                                lease,
                                deadline: new_deadline,
                            };
                        }
                    }
                    Err(LockError::InvalidReentry) => {
                        reply(&self.router, routing_id, wire::ERR_INVALID_REENTRY);
                    }
                    Err(err) => unreachable!("re-entry on a held lock failed: {err}"),
                }
            }
            RequestState::AbsentHeld { lease } => {
                // The client came back and the lock was already granted in
                // its absence; swap the short absent lease for the real one.
                reply(&self.router, routing_id, wire::OK);
                self.tasks.cancel(lease);
                let lease = self.tasks.add(
                    timeout,
                    TimerEvent::LeaseExpiry {
                        key: slot.0.clone(),
                        client_id: slot.1.clone(),
                    },
                );
                let request = self
                    .active_requests
                    .get_mut(&slot)
                    .expect("request disappeared mid-transition");
                request.routing_id = routing_id;
                request.timeout = timeout;
                request.state = RequestState::Held {
                    lease,
                    deadline: Instant::now() + timeout,
                };
            }
            RequestState::AbsentWaiting { give_up } => {
                self.tasks.cancel(give_up);
                if read_only != prev_read_only {
                    // The client changed its mind about the mode; drop its
                    // spot in the queue and start over from scratch.
                    self.lock_give_up(&slot.0, &slot.1);
                    self.active_requests.remove(&slot);
                    let (key, client_id) = slot;
                    self.initial_acquisition(routing_id, key, client_id, timeout, read_only);
                } else {
                    let advise_retry = self.tasks.add(
                        MAX_RESPONSE_TIME,
                        TimerEvent::AdviseRetry {
                            key: slot.0.clone(),
                            client_id: slot.1.clone(),
                        },
                    );
                    let request = self
                        .active_requests
                        .get_mut(&slot)
                        .expect("request disappeared mid-transition");
                    request.routing_id = routing_id;
                    request.timeout = timeout;
                    request.state = RequestState::PresentWaiting { advise_retry };
                }
            }
            RequestState::PresentWaiting { .. } => {
                // The previous request has not been answered yet.
                reply(&self.router, routing_id, wire::ERR_CONCURRENT);
            }
        }
    }

    /// A client asked to release a lock.
    pub(crate) fn release_request(&mut self, routing_id: RoutingId, key: Key, client_id: ClientId) {
        let slot = (key, client_id);
        let Some(state) = self.active_requests.get(&slot).map(|request| request.state) else {
            reply(&self.router, routing_id, wire::ERR_NOT_HELD);
            return;
        };

        match state {
            RequestState::Held { lease, .. } => {
                reply(&self.router, routing_id, wire::OK);
                let (granted, still_held) = self
                    .lock_release(&slot.0, &slot.1, false)
                    .expect("held request without a held lock");
                if !still_held {
                    self.tasks.cancel(lease);
                    self.active_requests.remove(&slot);
                }
                self.grant(&slot.0, granted);
            }
            RequestState::AbsentHeld { lease } => {
                // The lock was granted while the client was absent, but the
                // client never claimed it; it does not get to keep it.
                reply(&self.router, routing_id, wire::ERR_NOT_HELD);
                self.tasks.cancel(lease);
                let (granted, _) = self
                    .lock_release(&slot.0, &slot.1, true)
                    .expect("absent-held request without a held lock");
                self.active_requests.remove(&slot);
                self.grant(&slot.0, granted);
            }
            RequestState::PresentWaiting { .. } => {
                reply(&self.router, routing_id, wire::ERR_CONCURRENT);
            }
            RequestState::AbsentWaiting { .. } => {
                reply(&self.router, routing_id, wire::ERR_NOT_HELD);
            }
        }
    }

    /// Run a timer the event loop popped from the task queue.
    pub(crate) fn run_timer(&mut self, task: TaskId, event: TimerEvent) {
        match event {
            TimerEvent::AdviseRetry { key, client_id } => self.advise_retry(task, key, client_id),
            TimerEvent::GiveUp { key, client_id } => self.give_up(task, key, client_id),
            TimerEvent::LeaseExpiry { key, client_id } => self.lease_expired(task, key, client_id),
        }
    }

    /// First acquisition attempt for a slot with no tracked request.
    fn initial_acquisition(
        &mut self,
        routing_id: RoutingId,
        key: Key,
        client_id: ClientId,
        timeout: Duration,
        read_only: bool,
    ) {
        let lock = self.active_locks.entry(key.clone()).or_default();
        match lock.acquire(&client_id, read_only) {
            Ok(true) => {
                reply(&self.router, routing_id, wire::OK);
                let lease = self.tasks.add(
                    timeout,
                    TimerEvent::LeaseExpiry {
                        key: key.clone(),
                        client_id: client_id.clone(),
                    },
                );
                let deadline = Instant::now() + timeout;
                self.active_requests.insert(
                    (key, client_id),
                    LockRequest {
                        routing_id,
                        timeout,
                        read_only,
                        state: RequestState::Held { lease, deadline },
                    },
                );
            }
            Ok(false) => {
                // Queued; answer within MAX_RESPONSE_TIME one way or another.
                let advise_retry = self.tasks.add(
                    MAX_RESPONSE_TIME,
                    TimerEvent::AdviseRetry {
                        key: key.clone(),
                        client_id: client_id.clone(),
                    },
                );
                self.active_requests.insert(
                    (key, client_id),
                    LockRequest {
                        routing_id,
                        timeout,
                        read_only,
                        state: RequestState::PresentWaiting { advise_retry },
                    },
                );
            }
            Err(LockError::AlreadyWaiting) => {
                reply(&self.router, routing_id, wire::ERR_CONCURRENT);
                self.sweep_lock(&key);
            }
            Err(LockError::InvalidReentry) => {
                reply(&self.router, routing_id, wire::ERR_INVALID_REENTRY);
                self.sweep_lock(&key);
            }
            Err(LockError::NotHeld) => unreachable!("acquire cannot report NotHeld"),
        }
    }

    /// The lock was acquired for this slot because another client released
    /// it.
    fn on_triggered_acquisition(&mut self, key: &[u8], client_id: ClientId) {
        let slot = (key.to_vec(), client_id);
        let (state, routing_id, timeout) = self
            .active_requests
            .get(&slot)
            .map(|request| (request.state, request.routing_id, request.timeout))
            .expect("lock granted to a client with no pending request");

        match state {
            RequestState::PresentWaiting { advise_retry } => {
                reply(&self.router, routing_id, wire::OK);
                self.tasks.cancel(advise_retry);
                let lease = self.tasks.add(
                    timeout,
                    TimerEvent::LeaseExpiry {
                        key: slot.0.clone(),
                        client_id: slot.1.clone(),
                    },
                );
                let request = self
                    .active_requests
                    .get_mut(&slot)
                    .expect("request disappeared mid-transition");
                request.state = RequestState::Held {
                    lease,
                    deadline: Instant::now() + timeout,
                };
            }
            RequestState::AbsentWaiting { give_up } => {
                // The client was told to retry and is not back yet; hold the
                // lock for it, but only for the short absent lease.
                self.tasks.cancel(give_up);
                let lease = self.tasks.add(
                    MAX_ABSENT_TIME,
                    TimerEvent::LeaseExpiry {
                        key: slot.0.clone(),
                        client_id: slot.1.clone(),
                    },
                );
                let request = self
                    .active_requests
                    .get_mut(&slot)
                    .expect("request disappeared mid-transition");
                request.state = RequestState::AbsentHeld { lease };
            }
            RequestState::Held { .. } | RequestState::AbsentHeld { .. } => {
                unreachable!("lock granted to a client that already holds it")
            }
        }
    }

    fn advise_retry(&mut self, task: TaskId, key: Key, client_id: ClientId) {
        let slot = (key, client_id);
        let request = self
            .active_requests
            .get(&slot)
            .expect("advise-retry fired for an unknown request");
        match request.state {
            RequestState::PresentWaiting { advise_retry } if advise_retry == task => {}
            ref state => unreachable!("advise-retry fired in {state:?}"),
        }
        tracing::debug!(
            key = %String::from_utf8_lossy(&slot.0),
            client_id = %String::from_utf8_lossy(&slot.1),
            "Still waiting, telling client to retry"
        );
        reply(&self.router, request.routing_id, wire::RETRY);
        let give_up = self.tasks.add(
            MAX_ABSENT_TIME,
            TimerEvent::GiveUp {
                key: slot.0.clone(),
                client_id: slot.1.clone(),
            },
        );
        let request = self
            .active_requests
            .get_mut(&slot)
            .expect("request disappeared mid-transition");
        request.state = RequestState::AbsentWaiting { give_up };
    }

    fn give_up(&mut self, task: TaskId, key: Key, client_id: ClientId) {
        let slot = (key, client_id);
        match self.active_requests.get(&slot).map(|request| request.state) {
            Some(RequestState::AbsentWaiting { give_up }) if give_up == task => {}
            state => unreachable!("give-up fired in {state:?}"),
        }
        tracing::debug!(
            key = %String::from_utf8_lossy(&slot.0),
            client_id = %String::from_utf8_lossy(&slot.1),
            "Client did not come back, giving up on its behalf"
        );
        self.lock_give_up(&slot.0, &slot.1);
        self.active_requests.remove(&slot);
    }

    fn lease_expired(&mut self, task: TaskId, key: Key, client_id: ClientId) {
        let slot = (key, client_id);
        match self.active_requests.get(&slot).map(|request| request.state) {
            Some(
                RequestState::Held { lease, .. } | RequestState::AbsentHeld { lease },
            ) if lease == task => {}
            state => unreachable!("lease expiry fired in {state:?}"),
        }
        tracing::debug!(
            key = %String::from_utf8_lossy(&slot.0),
            client_id = %String::from_utf8_lossy(&slot.1),
            "Lease expired, releasing on the client's behalf"
        );
        let (granted, _) = self
            .lock_release(&slot.0, &slot.1, true)
            .expect("lease expired on a lock that is not held");
        self.active_requests.remove(&slot);
        self.grant(&slot.0, granted);
    }

    /// Feed every newly-granted client through its own transition.
    fn grant(&mut self, key: &[u8], clients: HashSet<ClientId>) {
        for client_id in clients {
            self.on_triggered_acquisition(key, client_id);
        }
    }

    /// Release on the lock table, reporting who got the lock next and
    /// whether the releasing client still holds it.
    fn lock_release(
        &mut self,
        key: &[u8],
        client_id: &[u8],
        fully: bool,
    ) -> Result<(HashSet<ClientId>, bool), LockError> {
        let lock = self.active_locks.get_mut(key).ok_or(LockError::NotHeld)?;
        let granted = lock.release(client_id, fully)?;
        let still_held = lock.is_held_by(client_id);
        self.sweep_lock(key);
        Ok((granted, still_held))
    }

    fn lock_give_up(&mut self, key: &[u8], client_id: &[u8]) {
        if let Some(lock) = self.active_locks.get_mut(key) {
            lock.give_up(client_id);
        }
        self.sweep_lock(key);
    }

    /// Locks exist in the active table only while somebody holds or waits.
    fn sweep_lock(&mut self, key: &[u8]) {
        if self.active_locks.get(key).map_or(false, |lock| lock.is_idle()) {
            self.active_locks.remove(key);
        }
    }
}
