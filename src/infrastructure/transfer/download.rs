//! Peripheral-to-client transfers.

use super::session::TransferSession;
use super::{BulkProtocol, BulkSignal, BulkTransferEngine};
use crate::domain::models::TransferState;
use crate::error::{AbortReason, DeviceError, Result};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Why the download loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadEnd {
    SizeReached,
    DeviceComplete,
    DeviceClosed,
    LastFragment,
    IdleRounds,
    IterationCap,
    ProgressTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub name: String,
    pub bytes: Vec<u8>,
    /// Size the peripheral announced, if it did
    pub announced: Option<usize>,
    pub end: DownloadEnd,
}

impl DownloadOutcome {
    /// Every announced byte arrived.
    pub fn is_complete(&self) -> bool {
        self.announced
            .is_some_and(|total| self.bytes.len() >= total)
    }
}

enum Round {
    Advanced,
    Idle,
    Finished(DownloadEnd),
}

impl<P: BulkProtocol> BulkTransferEngine<P> {
    /// Opens `name` with `open_frame` and assembles the payload.
    ///
    /// A short payload is not an error: the outcome carries what arrived and
    /// why the loop ended. Disconnects, device errors and cancellation abort.
    pub async fn download(&self, name: &str, open_frame: &[u8]) -> Result<DownloadOutcome> {
        let channels = self.channels()?;
        let mut pump = self.pump(channels);
        let mut transfer = TransferSession::download(name);
        let _armed = self.abort.arm();
        if self.abort.is_aborted() {
            info!(name, "Download cancelled before OPEN");
            return Err(DeviceError::abort(name, AbortReason::Cancelled));
        }

        transfer.set_state(TransferState::Opening);
        self.report(&transfer);
        self.write_control(open_frame, "OPEN").await?;
        transfer.set_state(TransferState::Active);
        transfer.touch();
        info!(name, "Download started");

        let next = self.protocol.next_frame();
        let mut iterations = 0u32;
        let result = loop {
            if self.abort.is_aborted() {
                break Err(AbortReason::Cancelled);
            }

            let before = transfer.transferred();
            if let Some(frame) = &next {
                if let Err(e) = self.write_control(frame, "NEXT").await {
                    debug!("NEXT failed: {}", e);
                    sleep(self.timing.chunk_retry_delay).await;
                }
            }

            match self.await_bytes(&mut pump, &mut transfer, before).await {
                Ok(Round::Finished(end)) => break Ok(end),
                Ok(Round::Advanced) => {
                    debug!(
                        received = transfer.transferred(),
                        total = ?transfer.total(),
                        "Chunk received"
                    );
                    self.report(&transfer);
                }
                Ok(Round::Idle) => {
                    let idle = transfer.idle_round();
                    debug!(idle, received = transfer.transferred(), "No progress");
                    if idle >= self.timing.idle_round_cap {
                        break Ok(DownloadEnd::IdleRounds);
                    }
                }
                Err(reason) => break Err(reason),
            }

            if transfer.is_complete() {
                break Ok(DownloadEnd::SizeReached);
            }
            iterations += 1;
            if iterations > self.timing.iteration_cap {
                break Ok(DownloadEnd::IterationCap);
            }
            if transfer.since_progress() > self.timing.progress_timeout {
                break Ok(DownloadEnd::ProgressTimeout);
            }
        };

        transfer.set_state(TransferState::Closing);
        if let Some(close) = self.protocol.close_frame() {
            self.write_quietly(&close, "CLOSE").await;
        }

        match result {
            Ok(end) => {
                transfer.set_state(TransferState::Completed);
                self.report(&transfer);
                let announced = transfer.total();
                let bytes = transfer.finalize();
                info!(
                    name,
                    received = bytes.len(),
                    announced = ?announced,
                    end = ?end,
                    "Download finished"
                );
                Ok(DownloadOutcome {
                    name: name.to_string(),
                    bytes,
                    announced,
                    end,
                })
            }
            Err(reason) => {
                warn!(name, %reason, "Download aborted");
                transfer.set_state(TransferState::Aborted);
                self.report(&transfer);
                Err(DeviceError::abort(name, reason))
            }
        }
    }

    /// One round: waits until more than `before` bytes are held, a terminal
    /// signal arrives, or the round times out.
    async fn await_bytes(
        &self,
        pump: &mut super::SignalPump<'_, P>,
        transfer: &mut TransferSession,
        before: usize,
    ) -> std::result::Result<Round, AbortReason> {
        let deadline = Instant::now() + self.timing.download_round;
        loop {
            for signal in pump.drain() {
                match signal {
                    BulkSignal::SizeAnnounced(size) => {
                        info!(size, "Size announced");
                        transfer.announce(size);
                        self.report(transfer);
                    }
                    BulkSignal::Data { bytes, last } => {
                        transfer.append(&bytes);
                        if last && (transfer.is_complete() || transfer.total().is_none()) {
                            return Ok(Round::Finished(DownloadEnd::LastFragment));
                        }
                    }
                    BulkSignal::Complete => return Ok(Round::Finished(DownloadEnd::DeviceComplete)),
                    BulkSignal::Closed => return Ok(Round::Finished(DownloadEnd::DeviceClosed)),
                    BulkSignal::Failed(reason) => return Err(reason),
                    BulkSignal::Disconnected => return Err(AbortReason::Disconnected),
                    BulkSignal::Credits(_) | BulkSignal::Ack | BulkSignal::Info(_) => {}
                }
            }
            // Byte count only; the round never inspects content.
            if transfer.transferred() > before || transfer.is_complete() {
                return Ok(Round::Advanced);
            }
            if self.abort.is_aborted() {
                return Err(AbortReason::Cancelled);
            }
            if Instant::now() >= deadline {
                return Ok(Round::Idle);
            }
            sleep(self.timing.download_poll).await;
        }
    }
}
