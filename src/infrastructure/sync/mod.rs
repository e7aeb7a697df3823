//! Feature drivers over the bulk transfer engine and the info service.
//!
//! History and wallpaper share the file-system characteristic set, so both
//! run their operations through one [`queue::SyncQueue`]. The JSON backup
//! in [`backup`] is built from the info snapshot.

pub mod backup;
pub mod history;
pub mod info;
pub mod queue;
pub mod wallpaper;
