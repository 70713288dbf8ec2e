pub mod hw;
pub mod message;
pub mod mutex;

pub use hw::asio::{
    AsioError, AsioListener, AudioFormat, BufferError, BufferSizes, ChannelInfo, Clocking,
    Direction, DoubleHalfBuffer, DoubleHalfRingBuffer, DriverError, DriverInfo, DriverRegistry,
    HalfBuffer, LibraryTransport, Line, LineInfo, Mixer, MixerInfo, SampleType, SimOp,
    SimulatedDevice, SimulatedTransport, Status, Ticket, Transport,
};
pub use hw::options::DriverOptions;
pub use message::{EventSource, LineEvent, LineEventKind};
