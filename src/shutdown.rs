use crate::error::{MuxError, Result};

/// Where a connection group stands in the shutdown agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// At least one reference, or a reservation, keeps the group open.
    Active,
    /// References reached zero and a shutdown request is in flight.
    PendingLocalZero,
    /// The peer refused; the request is re-sent on the next monitor tick.
    AwaitingPeer,
    /// Terminal.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Increment {
    Done,
    /// A negotiation or reservation is in progress; retry once it settles.
    Wait,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decrement {
    Done,
    /// References reached zero; start negotiating under this generation.
    Negotiate(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reserve {
    Reserved,
    Wait,
    /// The group is shutting down or gone and cannot be reused.
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Commit { forced: bool },
    Retry,
    /// The negotiation this answer belongs to was cancelled or superseded.
    Stale,
}

/// Reference counting and the two-party shutdown agreement of one group.
///
/// Pure state; the group drives it under its lock and performs the I/O the
/// returned decisions call for.
#[derive(Debug)]
pub(crate) struct ShutdownState {
    references: u32,
    reserved: bool,
    ready_to_shutdown: bool,
    remote_shutdown: bool,
    shutdown: bool,
    refusals: u32,
    max_refusals: u32,
    phase: ShutdownPhase,
    generation: u64,
}

impl ShutdownState {
    /// The single initial reference belongs to the group's creator.
    pub(crate) fn new(max_refusals: u32) -> Self {
        Self {
            references: 1,
            reserved: false,
            ready_to_shutdown: false,
            remote_shutdown: false,
            shutdown: false,
            refusals: 0,
            max_refusals,
            phase: ShutdownPhase::Active,
            generation: 0,
        }
    }

    pub(crate) fn phase(&self) -> ShutdownPhase {
        self.phase
    }

    pub(crate) fn references(&self) -> u32 {
        self.references
    }

    #[cfg(test)]
    fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    #[cfg(test)]
    fn is_reserved(&self) -> bool {
        self.reserved
    }

    #[cfg(test)]
    fn remote_shutdown(&self) -> bool {
        self.remote_shutdown
    }

    /// Returns to `Active`, abandoning any negotiation in progress.
    fn cancel_negotiation(&mut self) {
        self.phase = ShutdownPhase::Active;
        self.ready_to_shutdown = false;
        self.refusals = 0;
        self.generation += 1;
    }

    fn begin_negotiation(&mut self) -> u64 {
        self.phase = ShutdownPhase::PendingLocalZero;
        self.ready_to_shutdown = true;
        self.generation += 1;
        self.generation
    }

    pub(crate) fn try_increment(&mut self) -> Increment {
        if self.shutdown || self.remote_shutdown {
            return Increment::Shutdown;
        }
        if self.reserved {
            return Increment::Wait;
        }
        match self.phase {
            ShutdownPhase::PendingLocalZero => Increment::Wait,
            ShutdownPhase::AwaitingPeer => {
                self.cancel_negotiation();
                self.references += 1;
                Increment::Done
            }
            ShutdownPhase::Active => {
                self.references += 1;
                Increment::Done
            }
            ShutdownPhase::Shutdown => Increment::Shutdown,
        }
    }

    /// Never waits, not even on a reservation: a reserved group reaching zero
    /// simply does not negotiate until the reservation is dropped.
    pub(crate) fn try_decrement(&mut self) -> Result<Decrement> {
        if self.references == 0 {
            return Err(MuxError::ProtocolViolation(
                "group reference count underflow".to_string(),
            ));
        }
        self.references -= 1;
        if self.references == 0 && !self.reserved && self.phase == ShutdownPhase::Active {
            return Ok(Decrement::Negotiate(self.begin_negotiation()));
        }
        Ok(Decrement::Done)
    }

    /// Pins the group against shutdown while a caller decides to reuse it.
    pub(crate) fn reserve(&mut self) -> Reserve {
        if self.shutdown || self.remote_shutdown {
            return Reserve::Unavailable;
        }
        if self.reserved {
            return Reserve::Wait;
        }
        match self.phase {
            ShutdownPhase::Active => {}
            ShutdownPhase::AwaitingPeer => self.cancel_negotiation(),
            ShutdownPhase::PendingLocalZero | ShutdownPhase::Shutdown => {
                return Reserve::Unavailable;
            }
        }
        self.reserved = true;
        Reserve::Reserved
    }

    /// Ends a reservation without taking a reference. Returns the generation
    /// to negotiate under if that leaves the group unreferenced.
    pub(crate) fn unreserve(&mut self) -> Option<u64> {
        if !std::mem::replace(&mut self.reserved, false) {
            return None;
        }
        if self.references == 0 && self.phase == ShutdownPhase::Active && !self.shutdown {
            return Some(self.begin_negotiation());
        }
        None
    }

    /// Ends a reservation by taking a reference.
    pub(crate) fn acquire_reserved(&mut self) {
        self.reserved = false;
        self.references += 1;
    }

    /// Answer to the peer's shutdown request: true iff this end is also
    /// waiting to shut down. A true answer commits this end.
    pub(crate) fn on_peer_request(&mut self) -> bool {
        let accept = self.ready_to_shutdown
            && !self.reserved
            && !self.shutdown
            && self.phase != ShutdownPhase::Active;
        if accept {
            self.remote_shutdown = true;
        }
        accept
    }

    /// Applies the peer's answer to our request; `None` means it timed out.
    pub(crate) fn on_response(&mut self, generation: u64, accepted: Option<bool>) -> Outcome {
        if self.shutdown {
            return Outcome::Stale;
        }
        if self.remote_shutdown {
            return Outcome::Commit { forced: false };
        }
        if generation != self.generation || self.phase != ShutdownPhase::PendingLocalZero {
            return Outcome::Stale;
        }
        match accepted {
            Some(true) => Outcome::Commit { forced: false },
            None => Outcome::Commit { forced: true },
            Some(false) => {
                self.refusals += 1;
                if self.refusals >= self.max_refusals {
                    Outcome::Commit { forced: true }
                } else {
                    self.phase = ShutdownPhase::AwaitingPeer;
                    Outcome::Retry
                }
            }
        }
    }

    /// Monitor tick after a refusal. True if the request should be re-sent.
    pub(crate) fn on_recheck(&mut self, generation: u64) -> bool {
        if self.shutdown
            || generation != self.generation
            || self.phase != ShutdownPhase::AwaitingPeer
        {
            return false;
        }
        self.phase = ShutdownPhase::PendingLocalZero;
        true
    }

    /// Moves to the terminal state. Returns false if already there.
    pub(crate) fn commit(&mut self) -> bool {
        if self.shutdown {
            return false;
        }
        self.shutdown = true;
        self.ready_to_shutdown = true;
        self.phase = ShutdownPhase::Shutdown;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiating(state: &mut ShutdownState) -> u64 {
        match state.try_decrement().unwrap() {
            Decrement::Negotiate(generation) => generation,
            Decrement::Done => panic!("expected negotiation to start"),
        }
    }

    #[test]
    fn test_creator_reference() {
        let mut state = ShutdownState::new(3);
        assert_eq!(state.references(), 1);
        assert_eq!(state.phase(), ShutdownPhase::Active);

        assert_eq!(state.try_increment(), Increment::Done);
        assert_eq!(state.try_decrement().unwrap(), Decrement::Done);
        negotiating(&mut state);
        assert_eq!(state.phase(), ShutdownPhase::PendingLocalZero);
        assert!(state.try_decrement().is_err());
    }

    #[test]
    fn test_accepted_request_commits() {
        let mut state = ShutdownState::new(3);
        let generation = negotiating(&mut state);

        assert_eq!(
            state.on_response(generation, Some(true)),
            Outcome::Commit { forced: false }
        );
        assert!(state.commit());
        assert!(state.is_shutdown());
        assert!(!state.commit());
        assert_eq!(state.try_increment(), Increment::Shutdown);
    }

    #[test]
    fn test_timeout_forces_commit() {
        let mut state = ShutdownState::new(3);
        let generation = negotiating(&mut state);
        assert_eq!(
            state.on_response(generation, None),
            Outcome::Commit { forced: true }
        );
    }

    #[test]
    fn test_refusals_retry_then_force() {
        let mut state = ShutdownState::new(3);
        let generation = negotiating(&mut state);

        for _ in 0..2 {
            assert_eq!(state.on_response(generation, Some(false)), Outcome::Retry);
            assert_eq!(state.phase(), ShutdownPhase::AwaitingPeer);
            assert!(state.on_recheck(generation));
            assert_eq!(state.phase(), ShutdownPhase::PendingLocalZero);
        }
        assert_eq!(
            state.on_response(generation, Some(false)),
            Outcome::Commit { forced: true }
        );
    }

    #[test]
    fn test_increment_waits_while_request_in_flight() {
        let mut state = ShutdownState::new(3);
        let generation = negotiating(&mut state);
        assert_eq!(state.try_increment(), Increment::Wait);

        // A refusal lets the waiting increment cancel the negotiation
        assert_eq!(state.on_response(generation, Some(false)), Outcome::Retry);
        assert_eq!(state.try_increment(), Increment::Done);
        assert_eq!(state.phase(), ShutdownPhase::Active);
        assert_eq!(state.references(), 1);

        // The old generation's timer no longer applies
        assert!(!state.on_recheck(generation));
        assert_eq!(state.on_response(generation, Some(true)), Outcome::Stale);
    }

    #[test]
    fn test_peer_request_answered_by_readiness() {
        let mut state = ShutdownState::new(3);
        assert!(!state.on_peer_request());
        assert!(!state.remote_shutdown());

        let generation = negotiating(&mut state);
        assert!(state.on_peer_request());
        assert!(state.remote_shutdown());
        assert_eq!(state.try_increment(), Increment::Shutdown);
        assert_eq!(
            state.on_response(generation, Some(false)),
            Outcome::Commit { forced: false }
        );
    }

    #[test]
    fn test_reservation_blocks_shutdown() {
        let mut state = ShutdownState::new(3);
        assert_eq!(state.reserve(), Reserve::Reserved);
        assert_eq!(state.reserve(), Reserve::Wait);
        assert_eq!(state.try_increment(), Increment::Wait);

        // Dropping to zero while reserved does not start negotiating
        assert_eq!(state.try_decrement().unwrap(), Decrement::Done);
        assert!(!state.on_peer_request());

        // Releasing the reservation does
        assert!(state.unreserve().is_some());
        assert_eq!(state.phase(), ShutdownPhase::PendingLocalZero);
        assert_eq!(state.reserve(), Reserve::Unavailable);
    }

    #[test]
    fn test_reserved_acquire_keeps_group() {
        let mut state = ShutdownState::new(3);
        assert_eq!(state.try_decrement().unwrap(), Decrement::Negotiate(1));
        assert_eq!(state.on_response(1, Some(false)), Outcome::Retry);

        // Reuse of a refused group cancels its negotiation
        assert_eq!(state.reserve(), Reserve::Reserved);
        state.acquire_reserved();
        assert!(!state.is_reserved());
        assert_eq!(state.references(), 1);
        assert_eq!(state.phase(), ShutdownPhase::Active);
        assert_eq!(state.unreserve(), None);
    }
}
