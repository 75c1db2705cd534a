pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod led;
pub mod poll;
pub mod relay;
pub mod switch;
pub mod topics;
pub mod types;

pub use clock::MonotonicClock;
pub use command::{
    dispatch, dispatch_payload, parse_action_payload, parse_device_command, parse_relay_command,
    DeviceCommand, RelayAction, RelayCommand,
};
pub use config::{NetworkConfig, PinConfig, RelayTimingConfig, RuntimeConfig};
pub use error::CommandError;
pub use led::{LedOutputState, LedPattern};
pub use poll::{PollReport, PollStep};
pub use relay::{RelayEngine, RelayTransition};
pub use switch::{SwitchEvent, SwitchTracker};
pub use topics::*;
pub use types::{ChannelId, ChannelStatus, DeviceStatus, StatusSnapshot, Urgency};
