//! Message bus backends for switchyard
//!
//! This crate provides the two interchangeable implementations of
//! [`switchyard_core::MessageBus`]: a direct-dispatch in-process bus and a
//! broker-backed bus for agents spread across processes, plus the broker
//! server itself.

mod deliver;

pub mod broker;
pub mod broker_bus;
pub mod frame;
pub mod in_process;

use std::sync::Arc;

use switchyard_core::{BusBackend, MessageBus, Result};
use tracing::{info, warn};

// Re-export main types
pub use broker::{Broker, BrokerHandle, BrokerStats};
pub use broker_bus::BrokerBus;
pub use in_process::InProcessBus;

/// How to build a bus
#[derive(Debug, Clone)]
pub struct BusOptions {
    pub backend: BusBackend,
    pub broker_addr: String,
    /// Use the in-process bus when the broker cannot be reached
    pub fallback_to_in_process: bool,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            backend: BusBackend::InProcess,
            broker_addr: "127.0.0.1:7878".to_string(),
            fallback_to_in_process: true,
        }
    }
}

/// Create and start a bus for the configured backend
pub async fn create_bus(options: &BusOptions) -> Result<Arc<dyn MessageBus>> {
    match options.backend {
        BusBackend::InProcess => {
            let bus = InProcessBus::new();
            bus.start().await?;
            info!("Using in-process message bus");
            Ok(Arc::new(bus))
        }
        BusBackend::Broker => {
            let bus = BrokerBus::new(options.broker_addr.clone());
            match bus.start().await {
                Ok(()) => {
                    info!("Using broker message bus at {}", options.broker_addr);
                    Ok(Arc::new(bus))
                }
                Err(e) if options.fallback_to_in_process => {
                    warn!("Failed to reach broker: {}. Falling back to in-process bus", e);
                    let bus = InProcessBus::new();
                    bus.start().await?;
                    Ok(Arc::new(bus))
                }
                Err(e) => Err(e),
            }
        }
    }
}
