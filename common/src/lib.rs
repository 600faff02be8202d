pub mod address;
pub mod button;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod presence;
pub mod protocol;
pub mod provisioning;
pub mod store;
pub mod topics;

pub use address::HardwareAddress;
pub use button::{ButtonDebouncer, ButtonEdge, ButtonIntent, PressTracker};
pub use config::{ButtonConfig, HardwareConfig, NetworkConfig, PresenceConfig, RuntimeConfig};
pub use dispatch::{Command, CommandDispatcher, IntentOutcome};
pub use error::{Error, Result};
pub use identity::{DeviceIdentity, SetupCode, CATEGORY_SWITCH, SETUP_ID};
pub use presence::PresenceMonitor;
pub use protocol::DatagramTransport;
pub use provisioning::{parse_target_mac, ProvisioningEndpoint};
pub use store::{MemoryTargetStore, TargetRecord, TargetStore};
pub use topics::*;
