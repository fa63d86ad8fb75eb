//! Distributed counting semaphore over the versioned store.
//!
//! A semaphore is one counter record (`counters/<name>`) plus one claim
//! record per holder (`claims/<name>/<holder>`). Claiming and releasing
//! each commit the counter and the claim together in one transaction
//! conditioned on both versions, so `used` always equals the number of
//! claims and never exceeds the bound the caller passes in.

use taskgrid_state::{
    Keyspace, Precondition, SemaphoreCounter, SlotClaim, StateStore, TxnOutcome, WriteOp,
};
use tracing::{debug, warn};

use crate::error::EngineResult;
use crate::retry::{Attempt, CasRetry};

/// Name of the semaphore that bounds concurrently running tasks.
pub const ADMISSION: &str = "admission";

/// Outcome of [`DistributedSemaphore::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// A new slot was taken for the holder.
    Claimed,
    /// The holder already owns a slot; nothing changed.
    AlreadyHeld,
    /// Every slot is taken.
    Full,
}

#[derive(Clone)]
pub struct DistributedSemaphore {
    store: StateStore,
    name: String,
    /// Recorded on claims to identify the engine instance that made them.
    operation_id: String,
    retry: CasRetry,
}

impl DistributedSemaphore {
    pub fn new(store: StateStore, name: &str, operation_id: &str, retry: CasRetry) -> Self {
        Self {
            store,
            name: name.to_string(),
            operation_id: operation_id.to_string(),
            retry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take a slot for `holder` unless `max` slots are already in use.
    pub async fn claim(&self, holder: &str, max: u32) -> EngineResult<ClaimOutcome> {
        let claim_key = SlotClaim::key(&self.name, holder);
        self.retry
            .run(&self.name, || {
                if self.store.version(Keyspace::Claims, &claim_key)?.is_some() {
                    return Ok(Attempt::Done(ClaimOutcome::AlreadyHeld));
                }
                let counter = self.store.get_counter(&self.name)?;
                let (used, version) = match &counter {
                    Some(c) => (c.value.used, Some(c.version)),
                    None => (0, None),
                };
                if used >= max {
                    return Ok(Attempt::Done(ClaimOutcome::Full));
                }

                let claim = SlotClaim {
                    semaphore: self.name.clone(),
                    holder: holder.to_string(),
                    operation_id: self.operation_id.clone(),
                    claimed_at: crate::epoch_secs(),
                };
                let ops = [
                    WriteOp::put(
                        Keyspace::Counters,
                        self.name.as_str(),
                        &SemaphoreCounter { used: used + 1 },
                        Precondition::expecting(version),
                    )?,
                    WriteOp::put(Keyspace::Claims, claim_key.as_str(), &claim, Precondition::Absent)?,
                ];
                match self.store.transaction(&ops)? {
                    TxnOutcome::Committed { .. } => {
                        debug!(semaphore = %self.name, %holder, used = used + 1, max, "slot claimed");
                        Ok(Attempt::Done(ClaimOutcome::Claimed))
                    }
                    TxnOutcome::Conflict { .. } => Ok(Attempt::Retry),
                }
            })
            .await
    }

    /// Give back `holder`'s slot. Returns false when it held none.
    ///
    /// The claim is deleted in the same transaction that decrements the
    /// counter, so concurrent releases of the same holder decrement once.
    pub async fn release(&self, holder: &str) -> EngineResult<bool> {
        self.release_guarded(holder, None).await
    }

    /// Like [`release`](Self::release), but commits only while `guard` holds.
    ///
    /// Returns false without releasing when the guard fails.
    pub async fn release_guarded(&self, holder: &str, guard: Option<WriteOp>) -> EngineResult<bool> {
        let claim_key = SlotClaim::key(&self.name, holder);
        self.retry
            .run(&self.name, || {
                let Some(claim_version) = self.store.version(Keyspace::Claims, &claim_key)? else {
                    return Ok(Attempt::Done(false));
                };
                let counter = self.store.get_counter(&self.name)?;
                let (used, version) = match &counter {
                    Some(c) => (c.value.used, Some(c.version)),
                    None => (0, None),
                };
                if used == 0 {
                    warn!(semaphore = %self.name, %holder, "claim present but counter is zero");
                }

                let mut ops = vec![
                    WriteOp::delete(
                        Keyspace::Claims,
                        claim_key.as_str(),
                        Precondition::Version(claim_version),
                    ),
                    WriteOp::put(
                        Keyspace::Counters,
                        self.name.as_str(),
                        &SemaphoreCounter {
                            used: used.saturating_sub(1),
                        },
                        Precondition::expecting(version),
                    )?,
                ];
                if let Some(guard) = &guard {
                    ops.push(guard.clone());
                }

                match self.store.transaction(&ops)? {
                    TxnOutcome::Committed { .. } => {
                        debug!(semaphore = %self.name, %holder, used = used.saturating_sub(1), "slot released");
                        Ok(Attempt::Done(true))
                    }
                    TxnOutcome::Conflict { keyspace, key }
                        if guard
                            .as_ref()
                            .is_some_and(|g| g.keyspace == keyspace && g.key == key) =>
                    {
                        debug!(semaphore = %self.name, %holder, "release guard failed, keeping slot");
                        Ok(Attempt::Done(false))
                    }
                    TxnOutcome::Conflict { .. } => Ok(Attempt::Retry),
                }
            })
            .await
    }

    /// Number of slots in use.
    pub fn used(&self) -> EngineResult<u32> {
        Ok(self
            .store
            .get_counter(&self.name)?
            .map(|c| c.value.used)
            .unwrap_or(0))
    }

    /// Current holders, in key order.
    pub fn holders(&self) -> EngineResult<Vec<SlotClaim>> {
        Ok(self.store.list_claims(&self.name)?)
    }
}
