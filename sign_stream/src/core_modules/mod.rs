pub mod connection;
pub mod device;
pub mod reconciler;
pub mod scheduler;
pub mod transport;
