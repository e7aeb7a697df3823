//! Wallpaper images (raw RGB565 bitmaps) over the file-system service.
//!
//! Unlike history, reads are push-model: after READ the device streams
//! tagged DATA fragments on its own and announces the size on INFO.

use super::queue::SyncQueue;
use crate::error::{AbortReason, DeviceError, Result};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::service::DeviceSession;
use crate::infrastructure::transfer::session::{AbortHandle, ChunkLimits};
use crate::infrastructure::transfer::{
    BulkProtocol, BulkSignal, BulkTransferEngine, TransferTiming, UploadOutcome,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub mod op {
    pub const LIST: u8 = 0x10;
    pub const READ: u8 = 0x11;
    pub const WRITE_BEGIN: u8 = 0x20;
    pub const WRITE_DATA: u8 = 0x21;
    pub const WRITE_CLOSE: u8 = 0x22;
    pub const DELETE: u8 = 0x30;
    pub const RENAME: u8 = 0x31;
    pub const SHOW: u8 = 0x40;
}

/// INFO and DATA tags; the low bit marks the last fragment.
pub mod tag {
    pub const HEADER: u8 = 0x11;
    pub const LIST: u8 = 0xE0;
    pub const DATA: u8 = 0x90;
}

pub const MAX_IMAGES: usize = 5;
const MAX_NAME_LEN: usize = 16;
const IMAGE_EXTENSIONS: [&str; 4] = ["bin", "rgb565", "565", "raw"];
/// LVGL image header some encoders prepend.
const LVGL_HEADER_LEN: usize = 4;
const UPLOAD_MTU: usize = 517;
const SHOW_DELAY: Duration = Duration::from_millis(120);
const RELIST_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, Default)]
pub struct WallpaperProtocol;

impl BulkProtocol for WallpaperProtocol {
    fn label(&self) -> &'static str {
        "wallpaper"
    }

    /// Every 0x01 byte is one credit.
    fn status_signals(&self, value: &[u8]) -> Vec<BulkSignal> {
        let mut signals = Vec::new();
        let mut credits = 0u32;
        for &code in value {
            match code {
                0x01 => credits += 1,
                0x00 => signals.push(BulkSignal::Ack),
                // The device reports a bare rejection, no checksum.
                0xC3 => signals.push(BulkSignal::Failed(AbortReason::CrcMismatch {
                    expected: None,
                    actual: None,
                })),
                code if code >= 0x80 => {
                    signals.push(BulkSignal::Failed(AbortReason::DeviceError(code)))
                }
                other => debug!(code = other, "Unhandled wallpaper status"),
            }
        }
        if credits > 0 {
            signals.insert(0, BulkSignal::Credits(credits));
        }
        signals
    }

    fn data_signal(&self, value: &[u8]) -> Option<BulkSignal> {
        let (&first, rest) = value.split_first()?;
        (first & 0xFE == tag::DATA).then(|| BulkSignal::Data {
            bytes: rest.to_vec(),
            last: first & 0x01 == 1,
        })
    }

    fn info_signal(&self, value: &[u8]) -> Option<BulkSignal> {
        if let Some(header) = ImageHeader::parse(value) {
            debug!(
                width = header.width,
                height = header.height,
                size = header.size,
                "Image header"
            );
            return Some(BulkSignal::SizeAnnounced(header.size as usize));
        }
        Some(BulkSignal::Info(value.to_vec()))
    }

    fn info_complete(&self, value: &[u8]) -> bool {
        matches!(value.first(), Some(b'{') | Some(0xE1))
    }

    fn next_frame(&self) -> Option<Vec<u8>> {
        None
    }

    fn close_frame(&self) -> Option<Vec<u8>> {
        None
    }

    fn data_opcode(&self) -> u8 {
        op::WRITE_DATA
    }

    fn done_frame(&self) -> Vec<u8> {
        vec![op::WRITE_CLOSE]
    }

    fn upload_abort_frame(&self) -> Option<Vec<u8>> {
        Some(vec![op::WRITE_CLOSE])
    }
}

/// `[0x11][w u16][h u16][_][size u32]`, sent on INFO before a read streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub width: u16,
    pub height: u16,
    pub size: u32,
}

impl ImageHeader {
    pub fn parse(value: &[u8]) -> Option<Self> {
        if value.len() != 10 || value[0] != tag::HEADER {
            return None;
        }
        Some(Self {
            width: u16::from_le_bytes([value[1], value[2]]),
            height: u16::from_le_bytes([value[3], value[4]]),
            size: u32::from_le_bytes([value[6], value[7], value[8], value[9]]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WallpaperFile {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ListPayload {
    #[serde(default)]
    files: Vec<WallpaperFile>,
}

fn is_image_name(name: &str) -> bool {
    name.rsplit_once('.').is_some_and(|(_, ext)| {
        IMAGE_EXTENSIONS
            .iter()
            .any(|known| ext.eq_ignore_ascii_case(known))
    })
}

/// Reassembles either one plain JSON reply or tagged fragments, keeping
/// image files sorted by name.
pub fn parse_listing(replies: &[Vec<u8>]) -> Result<Vec<WallpaperFile>> {
    let mut text = Vec::new();
    for reply in replies {
        match reply.first() {
            Some(b'{') => {
                text = reply.clone();
                break;
            }
            Some(&t) if t & 0xFE == tag::LIST => text.extend_from_slice(&reply[1..]),
            _ => debug!(len = reply.len(), "Ignoring listing reply"),
        }
    }
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let payload: ListPayload = serde_json::from_slice(&text)?;
    let mut files: Vec<_> = payload
        .files
        .into_iter()
        .filter(|f| is_image_name(&f.name))
        .collect();
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

/// Strips any directory part and whitespace, forces a `.bin` extension
/// unless the name already has a raw-image one, then clips the stem so the
/// whole name fits in 16 characters.
pub fn normalize_name(name: &str) -> String {
    let base = name.rsplit(&['/', '\\'][..]).next().unwrap_or(name);
    let base: String = base.chars().filter(|c| !c.is_whitespace()).collect();
    let base = if base.is_empty() { "image".to_string() } else { base };
    let stem = base
        .rsplit_once('.')
        .map_or(base.as_str(), |(stem, _)| stem);
    let stem = if stem.is_empty() { "image" } else { stem };
    let keep = MAX_NAME_LEN - ".bin".len();
    let clipped: String = stem.chars().take(keep).collect();
    format!("{clipped}.bin")
}

/// Device paths carry a single leading `/`.
pub fn device_path(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

/// Raw RGB565, optionally behind a 4-byte LVGL header.
pub fn validate_bitmap(width: u16, height: u16, len: usize) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(DeviceError::InvalidImage(format!(
            "zero dimension {width}x{height}"
        )));
    }
    let pixels = usize::from(width) * usize::from(height) * 2;
    if len != pixels && len != pixels + LVGL_HEADER_LEN {
        return Err(DeviceError::InvalidImage(format!(
            "{width}x{height} RGB565 needs {pixels} bytes, got {len}"
        )));
    }
    Ok(())
}

/// `[0x20][nameLen][w u16][h u16][size u32][name]`
pub fn write_begin_frame(name: &str, width: u16, height: u16, size: usize) -> Result<Vec<u8>> {
    let name_len = u8::try_from(name.len())
        .map_err(|_| DeviceError::InvalidFrame(format!("name too long: {name}")))?;
    let size = u32::try_from(size)
        .map_err(|_| DeviceError::InvalidImage(format!("image too large: {size} bytes")))?;
    let mut frame = Vec::with_capacity(10 + name.len());
    frame.push(op::WRITE_BEGIN);
    frame.push(name_len);
    frame.extend_from_slice(&width.to_le_bytes());
    frame.extend_from_slice(&height.to_le_bytes());
    frame.extend_from_slice(&size.to_le_bytes());
    frame.extend_from_slice(name.as_bytes());
    Ok(frame)
}

/// `[0x31][fromLen][toLen][from][to]`
pub fn rename_frame(from: &str, to: &str) -> Result<Vec<u8>> {
    let too_long = |n: &str| DeviceError::InvalidFrame(format!("name too long: {n}"));
    let a = u8::try_from(from.len()).map_err(|_| too_long(from))?;
    let b = u8::try_from(to.len()).map_err(|_| too_long(to))?;
    let mut frame = vec![op::RENAME, a, b];
    frame.extend_from_slice(from.as_bytes());
    frame.extend_from_slice(to.as_bytes());
    Ok(frame)
}

pub struct WallpaperSync {
    engine: BulkTransferEngine<WallpaperProtocol>,
    queue: SyncQueue,
}

impl WallpaperSync {
    pub fn new(
        session: Arc<DeviceSession>,
        timing: TransferTiming,
        limits: ChunkLimits,
        queue: SyncQueue,
    ) -> Self {
        Self {
            engine: BulkTransferEngine::new(session, WallpaperProtocol, timing, limits),
            queue,
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.engine.abort_handle()
    }

    pub async fn list(&self) -> Result<Vec<WallpaperFile>> {
        self.queue.run("wallpaper list", || self.list_now()).await
    }

    async fn list_now(&self) -> Result<Vec<WallpaperFile>> {
        let replies = self
            .engine
            .request_info(&[op::LIST, 0x01, 0x00, b'/'], "LIST")
            .await?;
        let files = parse_listing(&replies)?;
        info!(count = files.len(), "Wallpaper listing");
        Ok(files)
    }

    /// Reads one stored image. Anything short of the announced size fails.
    pub async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = device_path(name);
        self.queue
            .run("wallpaper read", || async {
                let frame = protocol::name_frame(op::READ, &path)?;
                let outcome = self.engine.download(&path, &frame).await?;
                if !outcome.is_complete() {
                    return Err(DeviceError::abort(
                        &path,
                        AbortReason::SizeMismatch {
                            expected: outcome.announced.unwrap_or(0),
                            actual: outcome.bytes.len(),
                        },
                    ));
                }
                Ok(outcome.bytes)
            })
            .await
    }

    /// Stores a bitmap and shows it. Returns the name it was stored under.
    pub async fn upload(
        &self,
        name: &str,
        width: u16,
        height: u16,
        bytes: &[u8],
    ) -> Result<(String, UploadOutcome)> {
        validate_bitmap(width, height, bytes.len())?;
        let stored = normalize_name(name);
        self.queue
            .run("wallpaper upload", || async {
                let existing = self.list_now().await?;
                let target = device_path(&stored);
                let replacing = existing.iter().any(|f| device_path(&f.name) == target);
                if existing.len() >= MAX_IMAGES && !replacing {
                    warn!(count = existing.len(), "Wallpaper storage full");
                    return Err(DeviceError::StorageFull { limit: MAX_IMAGES });
                }

                let begin = write_begin_frame(&stored, width, height, bytes.len())?;
                let initial = self.engine.limits().initial_for_mtu(UPLOAD_MTU);
                let outcome = self.engine.upload(&stored, &begin, bytes, initial).await?;

                sleep(SHOW_DELAY).await;
                self.show_now(&stored).await?;
                sleep(RELIST_DELAY).await;
                if let Err(e) = self.list_now().await {
                    debug!("Listing after upload failed: {}", e);
                }
                Ok((stored.clone(), outcome))
            })
            .await
    }

    pub async fn show(&self, name: &str) -> Result<()> {
        self.queue
            .run("wallpaper show", || self.show_now(name))
            .await
    }

    async fn show_now(&self, name: &str) -> Result<()> {
        let frame = protocol::name_frame(op::SHOW, &device_path(name))?;
        self.engine.write_control(&frame, "SHOW").await
    }

    pub async fn delete(&self, name: &str) -> Result<Vec<WallpaperFile>> {
        self.queue
            .run("wallpaper delete", || async {
                let frame = protocol::name_frame(op::DELETE, &device_path(name))?;
                self.engine.write_control(&frame, "DELETE").await?;
                sleep(RELIST_DELAY).await;
                self.list_now().await
            })
            .await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<Vec<WallpaperFile>> {
        let to = normalize_name(to);
        self.queue
            .run("wallpaper rename", || async {
                let frame = rename_frame(&device_path(from), &device_path(&to))?;
                self.engine.write_control(&frame, "RENAME").await?;
                sleep(RELIST_DELAY).await;
                self.list_now().await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_counts_every_credit_byte() {
        let p = WallpaperProtocol;
        assert_eq!(
            p.status_signals(&[0x01, 0x01, 0x00, 0x01]),
            vec![BulkSignal::Credits(3), BulkSignal::Ack]
        );
        assert_eq!(
            p.status_signals(&[0xF4]),
            vec![BulkSignal::Failed(AbortReason::DeviceError(0xF4))]
        );
        assert_eq!(
            p.status_signals(&[0xC3]),
            vec![BulkSignal::Failed(AbortReason::CrcMismatch {
                expected: None,
                actual: None,
            })]
        );
    }

    #[test]
    fn test_data_tags() {
        let p = WallpaperProtocol;
        assert_eq!(
            p.data_signal(&[0x91, 1, 2]),
            Some(BulkSignal::Data {
                bytes: vec![1, 2],
                last: true
            })
        );
        assert_eq!(p.data_signal(&[0x42, 1]), None);
        assert_eq!(p.data_signal(&[]), None);
    }

    #[test]
    fn test_header_announces_size() {
        let header = [0x11, 0xF0, 0x00, 0xF0, 0x00, 0x00, 0x00, 0xC2, 0x01, 0x00];
        assert_eq!(
            ImageHeader::parse(&header),
            Some(ImageHeader {
                width: 240,
                height: 240,
                size: 115_200
            })
        );
        assert_eq!(
            WallpaperProtocol.info_signal(&header),
            Some(BulkSignal::SizeAnnounced(115_200))
        );
    }

    #[test]
    fn test_listing_from_fragments() {
        let replies = vec![
            b"\xE0{\"files\":[{\"name\":\"b.bin\",\"size\":8},".to_vec(),
            b"\xE1{\"name\":\"a.raw\"},{\"name\":\"notes.txt\"}]}".to_vec(),
        ];
        let files = parse_listing(&replies).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["a.raw", "b.bin"]);
        assert_eq!(files[1].size, Some(8));
    }

    #[test]
    fn test_listing_plain_json() {
        let replies = vec![b"{\"files\":[{\"name\":\"x.bin\",\"size\":2}]}".to_vec()];
        assert_eq!(parse_listing(&replies).unwrap().len(), 1);
        assert!(parse_listing(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("C:\\pics\\My Photo.png"), "MyPhoto.bin");
        assert_eq!(normalize_name("/a/sunset.raw"), "sunset.bin");
        assert_eq!(normalize_name("averyveryverylongname.bin"), "averyveryver.bin");
        assert_eq!(normalize_name(""), "image.bin");
        assert_eq!(device_path("x.bin"), "/x.bin");
        assert_eq!(device_path("/x.bin"), "/x.bin");
    }

    #[test]
    fn test_bitmap_validation() {
        assert!(validate_bitmap(2, 2, 8).is_ok());
        assert!(validate_bitmap(2, 2, 12).is_ok());
        assert!(matches!(
            validate_bitmap(2, 2, 9),
            Err(DeviceError::InvalidImage(_))
        ));
        assert!(validate_bitmap(0, 2, 0).is_err());
    }

    #[test]
    fn test_write_begin_layout() {
        let frame = write_begin_frame("a.bin", 240, 2, 960).unwrap();
        assert_eq!(
            frame,
            [0x20, 5, 0xF0, 0x00, 0x02, 0x00, 0xC0, 0x03, 0x00, 0x00, b'a', b'.', b'b', b'i', b'n']
        );
        assert_eq!(
            rename_frame("/a", "/bc").unwrap(),
            [0x31, 2, 3, b'/', b'a', b'/', b'b', b'c']
        );
    }
}
