pub mod file;

pub use file::{FILE_PROVIDER_NAME, FileProvider};
