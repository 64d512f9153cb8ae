//! Hardware interaction: transports, device inventory, sensor reads

pub mod inventory;
pub mod sensors;
pub mod transport;

pub use inventory::{CardId, DeviceInventory, HwmonInventory, ProductType};
pub use transport::{FanTransport, IoctlTransport, SerialTransport};
