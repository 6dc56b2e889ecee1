//! Guest physical memory access for bus-mastering devices.

pub mod bus;
mod ram;

pub use bus::MemoryBus;
pub use ram::Bus;
