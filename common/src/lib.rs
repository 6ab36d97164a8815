pub mod button;
pub mod clock;
pub mod config;
pub mod device;
pub mod endpoints;
pub mod gate;
pub mod io;
pub mod lifecycle;
pub mod outputs;
pub mod sim;
pub mod storage;
pub mod types;

pub use button::Gesture;
pub use clock::{Clock, Delay, LogicalClock};
pub use config::{
    ButtonConfig, ConfigureRequest, IdentityConfig, LifecycleConfig, NodeConfig, OutputConfig,
    WifiConfig,
};
pub use device::DeviceState;
pub use endpoints::*;
pub use gate::GateDecision;
pub use io::{
    ButtonInput, Indicators, Light, LinkError, Network, OutputLine, Outputs, Sensors, ServerLink,
};
pub use lifecycle::{Node, NodeIo, Scheduler, Tick, WakeRecord};
pub use outputs::OutputAction;
pub use storage::{Flash, MemoryFlash, PersistentStore, StoreError, StringRegion};
pub use types::{Directive, HttpReply, OperatingMode, SensorReport, StoredConfigView};
