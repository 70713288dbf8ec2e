//! ASIO driver binding: one exclusive driver per process, shared by every
//! line that is opened on it.
//!
//! [`DriverRegistry`] owns a [`Transport`] and serializes the driver
//! lifecycle. Each [`Mixer`] is one named driver; its [`Line`]s move bytes
//! through per-channel [`DoubleHalfRingBuffer`]s that the driver's buffer
//! switch drains and fills.

pub mod convert;
mod dispatch;
pub mod error;
mod events;
pub mod format;
pub mod half_buffer;
pub mod library;
pub mod line;
pub mod listener;
pub mod mixer;
pub mod registry;
pub mod ring_buffer;
pub mod simulated;
pub mod transport;

pub use error::{AsioError, BufferError, DriverError};
pub use format::{AudioFormat, Encoding, POSSIBLE_RATES, SampleType};
pub use half_buffer::{DoubleHalfBuffer, HalfBuffer};
pub use library::LibraryTransport;
pub use line::{Direction, Line, LineInfo};
pub use listener::AsioListener;
pub use mixer::{Mixer, Status};
pub use registry::{DriverRegistry, MixerInfo, Ticket};
pub use ring_buffer::DoubleHalfRingBuffer;
pub use simulated::{Clocking, SimOp, SimulatedDevice, SimulatedTransport};
pub use transport::{
    BufferRequest, BufferSizes, ChannelInfo, ClockSource, DriverCallbacks, DriverInfo,
    MessageSelector, TimeInfo, Transport,
};
