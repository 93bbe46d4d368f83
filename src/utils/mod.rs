pub mod atomic_file;
pub mod graceful_shutdown;
