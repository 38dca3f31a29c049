//! Everything needed to drive the physical radio: the capability the MAC
//! consumes, the frame codec and the available radio implementations.

pub mod device;
pub mod frame;
pub mod hal;
pub mod sim;

pub use device::*;
