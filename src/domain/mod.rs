pub mod history;
pub mod models;
pub mod recovery;
pub mod settings;
