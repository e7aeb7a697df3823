pub mod bluetooth;
pub mod logging;
pub mod sync;
pub mod transfer;
