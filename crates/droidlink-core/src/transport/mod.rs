//! Transport layer module.

pub mod descriptor;
pub mod mock;
pub mod nusb;
pub mod session;
pub mod traits;

pub use descriptor::{DeviceDescriptor, DeviceFilter, android_filters};
pub use mock::{MockHost, MockTransport};
pub use self::nusb::{NusbHost, NusbTransport, Selection};
pub use session::{Deadline, OpenFailure, TransportSession};
pub use traits::{HostCapabilities, TransportError, UsbHost, UsbTransport};
