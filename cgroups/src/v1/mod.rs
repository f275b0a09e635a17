pub mod devices;
pub mod util;

pub use devices::{DeviceRule, DeviceType, HostWhitelist};
