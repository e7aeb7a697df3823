//! Simulated rosary file system behind a `MockTransport`.
#![allow(dead_code)]

use rosary_companion::infrastructure::bluetooth::mock::MockTransport;
use rosary_companion::infrastructure::bluetooth::transport::TransportEvent;
use rosary_companion::{CharacteristicRole, DeviceSession, SessionConfig};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
pub struct FsState {
    /// Contents of `history.bin`
    pub history: Vec<u8>,
    /// Size sent in the 0xD0 announcement instead of the real length
    pub announce_override: Option<u32>,
    /// Bytes served per NEXT
    pub serve_chunk: usize,
    /// Answer nothing at all to OPEN and NEXT
    pub silent: bool,
    /// Credits granted after BEGIN
    pub initial_credits: u32,
    /// Grant a credit for every accepted DATA frame
    pub auto_credit: bool,
    pub upload: Option<Vec<u8>>,
    pub cursor: usize,
    pub rejected_frames: usize,
}

#[derive(Clone)]
pub struct SimulatedFs {
    pub mock: MockTransport,
    pub state: Arc<Mutex<FsState>>,
}

fn status(code: u8, aux: u32) -> TransportEvent {
    let mut value = vec![code];
    value.extend_from_slice(&aux.to_le_bytes());
    TransportEvent::Notification {
        uuid: MockTransport::uuid(CharacteristicRole::FsStatus),
        value,
    }
}

fn on(role: CharacteristicRole, value: Vec<u8>) -> TransportEvent {
    TransportEvent::Notification {
        uuid: MockTransport::uuid(role),
        value,
    }
}

impl SimulatedFs {
    pub fn new(history: Vec<u8>) -> Self {
        let mock = MockTransport::rosary();
        let state = Arc::new(Mutex::new(FsState {
            history,
            serve_chunk: 180,
            initial_credits: 2,
            auto_credit: true,
            ..FsState::default()
        }));
        let fs_control = MockTransport::uuid(CharacteristicRole::FsControl);
        let hook_state = state.clone();
        mock.on_write(move |uuid, frame| {
            if uuid != fs_control {
                return Vec::new();
            }
            let mut fs = hook_state.lock().unwrap();
            handle(&mut fs, frame)
        });
        Self { mock, state }
    }

    pub fn configure(&self, f: impl FnOnce(&mut FsState)) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn history(&self) -> Vec<u8> {
        self.state.lock().unwrap().history.clone()
    }

    /// DATA frames written so far, opcode and trailer included.
    pub fn data_frames(&self, opcode: u8) -> Vec<Vec<u8>> {
        self.mock
            .writes_to(CharacteristicRole::FsControl)
            .into_iter()
            .filter(|w| w.first() == Some(&opcode))
            .collect()
    }

    pub async fn connect(&self) -> Arc<DeviceSession> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = DeviceSession::connect(Arc::new(self.mock.clone()), SessionConfig::default(), tx)
            .await
            .unwrap();
        Arc::new(session)
    }
}

fn handle(fs: &mut FsState, frame: &[u8]) -> Vec<TransportEvent> {
    let Some((&op, body)) = frame.split_first() else {
        return Vec::new();
    };
    match op {
        0x70 => {
            let listing = format!(
                "{{\"name\":\"history.bin\",\"size\":{}}}\n{{\"fs\":\"sim\"}}",
                fs.history.len()
            );
            vec![on(CharacteristicRole::FsInfo, listing.into_bytes())]
        }
        0x71 if fs.silent => Vec::new(),
        0x71 => {
            fs.cursor = 0;
            let size = fs
                .announce_override
                .unwrap_or(fs.history.len() as u32);
            vec![status(0xD0, size)]
        }
        0x72 if fs.silent => Vec::new(),
        0x72 => {
            if fs.cursor >= fs.history.len() {
                return Vec::new();
            }
            let end = (fs.cursor + fs.serve_chunk).min(fs.history.len());
            let chunk = fs.history[fs.cursor..end].to_vec();
            fs.cursor = end;
            vec![on(CharacteristicRole::FsData, chunk)]
        }
        0x73 => Vec::new(),
        0x77 => {
            fs.upload = Some(Vec::new());
            (0..fs.initial_credits).map(|_| status(0x01, 0)).collect()
        }
        0x78 => {
            let Some(upload) = fs.upload.as_mut() else {
                return vec![status(0xC3, 0)];
            };
            if body.len() < 4 {
                return vec![status(0xC3, 0)];
            }
            let (chunk, trailer) = body.split_at(body.len() - 4);
            let crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
            if crc32fast::hash(chunk) != crc {
                fs.rejected_frames += 1;
                return vec![status(0xC3, crc)];
            }
            upload.extend_from_slice(chunk);
            if fs.auto_credit {
                vec![status(0x01, 0)]
            } else {
                Vec::new()
            }
        }
        0x79 => {
            if let Some(upload) = fs.upload.take() {
                fs.history = upload;
            }
            vec![status(0x00, 0)]
        }
        _ => Vec::new(),
    }
}

/// `count` distinct 5-byte history records.
pub fn sample_history(count: usize) -> Vec<u8> {
    (0..count)
        .flat_map(|i| {
            let mut record = (1_700_000_000u32 + i as u32 * 60).to_le_bytes().to_vec();
            record.push(((i % 5) as u8) << 5 | ((i % 6) as u8) << 2 | (i % 2) as u8);
            record
        })
        .collect()
}
