//! Client-to-peripheral transfers, gated by device credits.

use super::session::{ChunkSizer, CreditCounter, TransferSession};
use super::{BulkProtocol, BulkSignal, BulkTransferEngine, SignalPump};
use crate::domain::models::TransferState;
use crate::error::{AbortReason, DeviceError, Result};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub name: String,
    pub sent: usize,
    pub frames: usize,
    /// Chunk size in effect when the last frame went out
    pub final_chunk: usize,
}

/// `[op][chunk][crc32 LE]`
pub fn data_frame(opcode: u8, chunk: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + chunk.len() + 4);
    frame.push(opcode);
    frame.extend_from_slice(chunk);
    frame.extend_from_slice(&crc32fast::hash(chunk).to_le_bytes());
    frame
}

struct CreditGate {
    credits: CreditCounter,
    last_credit: Instant,
}

impl CreditGate {
    fn apply(&mut self, signals: Vec<BulkSignal>) -> std::result::Result<(), AbortReason> {
        for signal in signals {
            match signal {
                BulkSignal::Credits(n) if n > 0 => {
                    self.credits.grant(n);
                    self.last_credit = Instant::now();
                }
                BulkSignal::Failed(reason) => return Err(reason),
                BulkSignal::Disconnected => return Err(AbortReason::Disconnected),
                _ => {}
            }
        }
        Ok(())
    }
}

impl<P: BulkProtocol> BulkTransferEngine<P> {
    /// Writes `begin_frame`, then streams `bytes` one credit per chunk and
    /// finishes with the protocol's DONE frame.
    pub async fn upload(
        &self,
        name: &str,
        begin_frame: &[u8],
        bytes: &[u8],
        initial_chunk: usize,
    ) -> Result<UploadOutcome> {
        let channels = self.channels()?;
        let mut pump = self.pump(channels);
        let mut transfer = TransferSession::upload(name, bytes.len());
        let mut sizer = ChunkSizer::new(self.limits, initial_chunk);
        let _armed = self.abort.arm();
        if self.abort.is_aborted() {
            info!(name, "Upload cancelled before BEGIN");
            return Err(DeviceError::abort(name, AbortReason::Cancelled));
        }

        transfer.set_state(TransferState::Opening);
        self.report(&transfer);
        self.write_control(begin_frame, "BEGIN").await?;
        info!(name, size = bytes.len(), chunk = sizer.current(), "Upload started");

        let mut gate = CreditGate {
            credits: CreditCounter::new(),
            last_credit: Instant::now(),
        };
        transfer.touch();

        let result = match self.await_first_credit(&mut pump, &mut gate).await {
            Ok(()) => {
                transfer.set_state(TransferState::Active);
                self.stream(&mut pump, &mut gate, &mut transfer, &mut sizer, bytes)
                    .await
            }
            Err(reason) => Err(reason),
        };

        match result {
            Ok(frames) => {
                transfer.set_state(TransferState::Closing);
                self.write_quietly(&self.protocol.done_frame(), "DONE").await;
                // A rejection of the final chunk can trail the last write.
                if let Err(reason) = gate.apply(pump.drain()) {
                    return Err(self.fail(&mut transfer, reason).await);
                }
                transfer.set_state(TransferState::Completed);
                self.report(&transfer);
                info!(name, frames, "Upload finished");
                Ok(UploadOutcome {
                    name: name.to_string(),
                    sent: transfer.transferred(),
                    frames,
                    final_chunk: sizer.current(),
                })
            }
            Err(reason) => Err(self.fail(&mut transfer, reason).await),
        }
    }

    async fn fail(&self, transfer: &mut TransferSession, reason: AbortReason) -> DeviceError {
        warn!(name = transfer.name(), sent = transfer.transferred(), %reason, "Upload aborted");
        if reason != AbortReason::Disconnected {
            if let Some(frame) = self.protocol.upload_abort_frame() {
                self.write_quietly(&frame, "ABORT").await;
            }
        }
        transfer.set_state(TransferState::Aborted);
        self.report(transfer);
        DeviceError::abort(transfer.name(), reason)
    }

    async fn await_first_credit(
        &self,
        pump: &mut SignalPump<'_, P>,
        gate: &mut CreditGate,
    ) -> std::result::Result<(), AbortReason> {
        let started = Instant::now();
        loop {
            gate.apply(pump.drain())?;
            if gate.credits.available() > 0 {
                debug!(credits = gate.credits.available(), "Initial credit granted");
                return Ok(());
            }
            if self.abort.is_aborted() {
                return Err(AbortReason::Cancelled);
            }
            if started.elapsed() >= self.timing.initial_credit_timeout {
                return Err(AbortReason::NoInitialCredit);
            }
            sleep(self.timing.credit_poll).await;
        }
    }

    async fn stream(
        &self,
        pump: &mut SignalPump<'_, P>,
        gate: &mut CreditGate,
        transfer: &mut TransferSession,
        sizer: &mut ChunkSizer,
        bytes: &[u8],
    ) -> std::result::Result<usize, AbortReason> {
        let mut offset = 0;
        let mut frames = 0;
        while offset < bytes.len() {
            // Credit gate
            loop {
                gate.apply(pump.drain())?;
                if gate.credits.try_consume() {
                    break;
                }
                if self.abort.is_aborted() {
                    return Err(AbortReason::Cancelled);
                }
                if gate.last_credit.elapsed() > self.timing.credit_stall {
                    let chunk = sizer.halve();
                    debug!(chunk, "Credit stall, chunk halved");
                    gate.last_credit = Instant::now();
                }
                if transfer.since_progress() > self.timing.progress_timeout {
                    return Err(AbortReason::StallTimeout);
                }
                sleep(self.timing.credit_poll).await;
            }

            let n = sizer.current().min(bytes.len() - offset);
            let frame = data_frame(self.protocol.data_opcode(), &bytes[offset..offset + n]);
            self.write_chunk(&frame, offset).await?;

            offset += n;
            frames += 1;
            transfer.advance(n);
            self.report(transfer);

            if gate.last_credit.elapsed() < self.timing.fast_credit_window {
                sizer.grow();
            }
        }
        Ok(frames)
    }

    async fn write_chunk(&self, frame: &[u8], offset: usize) -> std::result::Result<(), AbortReason> {
        let attempts = self.timing.chunk_write_attempts.max(1);
        for attempt in 1..=attempts {
            match self.write_control(frame, "DATA").await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(offset, attempt, "Chunk write failed: {}", e);
                    sleep(self.timing.chunk_retry_delay).await;
                }
            }
        }
        Err(AbortReason::WriteFailed { attempts })
    }
}
