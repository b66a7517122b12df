pub mod shutdown;
pub mod tcp;

pub use shutdown::{ShutdownReceiver, ShutdownSender};
pub use tcp::{serve, TcpSender};
