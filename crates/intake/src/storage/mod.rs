pub mod filesystem;

pub use filesystem::{sanitize_file_name, FileStorage};
