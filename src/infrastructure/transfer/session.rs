//! Per-transfer state: byte accounting, chunk sizing and credits.

use crate::domain::models::{TransferDirection, TransferProgress, TransferState};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// ATT header plus the opcode byte and the CRC trailer.
const FRAME_OVERHEAD: usize = 3 + 1 + 4;

/// Bounds for the adaptive upload chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    pub min: usize,
    pub max: usize,
    pub step: usize,
}

impl ChunkLimits {
    pub fn new(min: usize, max: usize, step: usize) -> Self {
        let min = min.max(1);
        Self {
            min,
            max: max.max(min),
            step,
        }
    }

    pub fn clamp(&self, size: usize) -> usize {
        size.clamp(self.min, self.max)
    }

    /// Largest chunk one frame can carry at the negotiated MTU.
    pub fn initial_for_mtu(&self, mtu: usize) -> usize {
        let base = if mtu >= 23 {
            mtu.saturating_sub(FRAME_OVERHEAD)
        } else {
            20usize.saturating_sub(FRAME_OVERHEAD - 3)
        };
        self.clamp(base)
    }
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self::new(40, 200, 16)
    }
}

/// Current upload chunk size, always inside its limits.
#[derive(Debug, Clone)]
pub struct ChunkSizer {
    limits: ChunkLimits,
    current: usize,
}

impl ChunkSizer {
    pub fn new(limits: ChunkLimits, initial: usize) -> Self {
        Self {
            current: limits.clamp(initial),
            limits,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Credit stall: next chunk is half the previous one, rounded up.
    pub fn halve(&mut self) -> usize {
        self.current = self.limits.clamp(self.current.div_ceil(2));
        self.current
    }

    /// Link is keeping up: grow by one step.
    pub fn grow(&mut self) -> usize {
        self.current = self.limits.clamp(self.current + self.limits.step);
        self.current
    }
}

/// Credits granted by the peripheral, one per chunk.
#[derive(Debug, Default)]
pub struct CreditCounter {
    available: AtomicU32,
}

impl CreditCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, credits: u32) {
        let _ = self
            .available
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_add(credits))
            });
    }

    /// Takes one credit if any is available.
    pub fn try_consume(&self) -> bool {
        self.available
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn available(&self) -> u32 {
        self.available.load(Ordering::SeqCst)
    }
}

/// Cooperative cancellation flag checked by every transfer loop.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Scopes the flag to one transfer. An abort raised before the transfer
    /// starts still cancels it; the flag clears when the guard drops.
    pub fn arm(&self) -> AbortGuard<'_> {
        AbortGuard { handle: self }
    }
}

/// Clears its [`AbortHandle`] on drop.
#[must_use = "the abort flag clears when the guard drops"]
pub struct AbortGuard<'a> {
    handle: &'a AbortHandle,
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        self.handle.reset();
    }
}

pub struct TransferSession {
    name: String,
    direction: TransferDirection,
    state: TransferState,
    total: Option<usize>,
    transferred: usize,
    buffer: Vec<u8>,
    last_progress: Instant,
    idle_rounds: u32,
}

impl TransferSession {
    pub fn download(name: &str) -> Self {
        Self::new(name, TransferDirection::Download, None)
    }

    pub fn upload(name: &str, total: usize) -> Self {
        Self::new(name, TransferDirection::Upload, Some(total))
    }

    fn new(name: &str, direction: TransferDirection, total: Option<usize>) -> Self {
        Self {
            name: name.to_string(),
            direction,
            state: TransferState::Idle,
            total,
            transferred: 0,
            buffer: Vec::new(),
            last_progress: Instant::now(),
            idle_rounds: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Moves forward through the lifecycle. Terminal states are final.
    pub fn set_state(&mut self, state: TransferState) {
        if self.state.is_terminal() {
            return;
        }
        debug!(name = %self.name, from = ?self.state, to = ?state, "Transfer state");
        self.state = state;
    }

    pub fn total(&self) -> Option<usize> {
        self.total
    }

    pub fn transferred(&self) -> usize {
        self.transferred
    }

    pub fn remaining(&self) -> usize {
        self.total
            .map_or(0, |total| total.saturating_sub(self.transferred))
    }

    pub fn is_complete(&self) -> bool {
        self.total
            .is_some_and(|total| total > 0 && self.transferred >= total)
    }

    /// The peripheral announced the payload size; earlier bytes are discarded.
    pub fn announce(&mut self, size: usize) {
        if size == 0 {
            debug!(name = %self.name, "Size announcement of 0 ignored");
            return;
        }
        if self.transferred > 0 {
            warn!(
                name = %self.name,
                dropped = self.transferred,
                "Size announced mid-transfer, restarting buffer"
            );
        }
        self.total = Some(size);
        self.buffer = Vec::with_capacity(size);
        self.transferred = 0;
        self.touch();
    }

    /// Appends received bytes; anything past the announced size is dropped.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let take = match self.total {
            Some(total) => bytes.len().min(total.saturating_sub(self.transferred)),
            None => bytes.len(),
        };
        if take < bytes.len() {
            warn!(
                name = %self.name,
                excess = bytes.len() - take,
                "Dropping bytes beyond the announced size"
            );
        }
        self.buffer.extend_from_slice(&bytes[..take]);
        self.transferred += take;
        if take > 0 {
            self.touch();
        }
        take
    }

    /// Upload side: `sent` more bytes reached the peripheral.
    pub fn advance(&mut self, sent: usize) {
        self.transferred += sent;
        if let Some(total) = self.total {
            self.transferred = self.transferred.min(total);
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_progress = Instant::now();
        self.idle_rounds = 0;
    }

    pub fn since_progress(&self) -> std::time::Duration {
        self.last_progress.elapsed()
    }

    pub fn idle_round(&mut self) -> u32 {
        self.idle_rounds += 1;
        self.idle_rounds
    }

    pub fn idle_rounds(&self) -> u32 {
        self.idle_rounds
    }

    /// Buffer trimmed to the lesser of announced and received size.
    pub fn finalize(mut self) -> Vec<u8> {
        let keep = self
            .total
            .map_or(self.transferred, |total| total.min(self.transferred));
        self.buffer.truncate(keep);
        self.buffer
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            name: self.name.clone(),
            direction: self.direction,
            state: self.state,
            transferred: self.transferred,
            total: self.total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_halving_rounds_up_and_floors() {
        let mut sizer = ChunkSizer::new(ChunkLimits::default(), 200);
        assert_eq!(sizer.halve(), 100);
        assert_eq!(sizer.halve(), 50);
        assert_eq!(sizer.halve(), 40);
        assert_eq!(sizer.halve(), 40);

        let mut odd = ChunkSizer::new(ChunkLimits::default(), 161);
        assert_eq!(odd.halve(), 81);
    }

    #[test]
    fn test_chunk_growth_capped() {
        let mut sizer = ChunkSizer::new(ChunkLimits::default(), 190);
        assert_eq!(sizer.grow(), 200);
        assert_eq!(sizer.grow(), 200);
        assert_eq!(ChunkSizer::new(ChunkLimits::default(), 5).current(), 40);
    }

    #[test]
    fn test_initial_chunk_from_mtu() {
        let limits = ChunkLimits::default();
        assert_eq!(limits.initial_for_mtu(517), 200);
        assert_eq!(limits.initial_for_mtu(23), 40);
        assert_eq!(ChunkLimits::new(10, 400, 16).initial_for_mtu(247), 239);
    }

    #[test]
    fn test_credits_never_negative() {
        let credits = CreditCounter::new();
        assert!(!credits.try_consume());
        credits.grant(2);
        assert!(credits.try_consume());
        assert!(credits.try_consume());
        assert!(!credits.try_consume());
        assert_eq!(credits.available(), 0);
    }

    #[test]
    fn test_download_accounting() {
        let mut session = TransferSession::download("history.bin");
        session.append(&[9; 10]);
        session.announce(100);
        assert_eq!(session.transferred(), 0);
        session.append(&[1; 60]);
        session.append(&[2; 60]);
        assert_eq!(session.transferred(), 100);
        assert!(session.is_complete());
        assert_eq!(session.finalize().len(), 100);
    }

    #[test]
    fn test_finalize_short_download() {
        let mut session = TransferSession::download("history.bin");
        session.announce(1000);
        session.append(&[7; 800]);
        assert!(!session.is_complete());
        assert_eq!(session.finalize().len(), 800);
    }

    #[test]
    fn test_terminal_state_is_final() {
        let mut session = TransferSession::upload("a.bin", 10);
        session.set_state(TransferState::Aborted);
        session.set_state(TransferState::Active);
        assert_eq!(session.state(), TransferState::Aborted);
    }

    #[test]
    fn test_abort_raised_before_arming_survives_until_guard_drops() {
        let handle = AbortHandle::new();
        handle.abort();
        {
            let _armed = handle.arm();
            assert!(handle.is_aborted());
        }
        assert!(!handle.is_aborted());
    }
}
