//! TideNet Core Library
//! Tick-driven session transport over UDP and in-process datagrams

pub mod clock;
pub mod config;
pub mod data_stream;
pub mod endpoint;
pub mod error;
pub mod event_queue;
pub mod multi_queue;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::NetworkConfig;
pub use data_stream::{DataStreamReader, DataStreamWriter, DeferredWrite, ReadContext};
pub use endpoint::{NetworkEndPoint, NetworkFamily};
pub use error::{NetworkError, Result};
pub use event_queue::{NetworkEvent, NetworkEventType};
pub use transport::{
    ConcurrentDriver, ConnectionState, DriverStatistics, IpcHub, NetworkConnection, NetworkDriver,
    NetworkInterface,
};

/// Initialize the core library (logging)
pub fn init() {
    // Embedding applications may have installed their own subscriber already;
    // "already set" is a no-op.
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    );

    tracing::info!("TideNet Core Initialized (logger ready)");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        init();
        init();
    }

    #[tokio::test]
    async fn test_async_init() {
        init();
        tracing::info!("Async test running");
    }
}
