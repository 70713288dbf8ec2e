use crate::hw::asio::Direction;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LineEventKind {
    Open,
    Close,
    Start,
    Stop,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventSource {
    Mixer {
        driver: String,
    },
    Line {
        driver: String,
        direction: Direction,
        channel: usize,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineEvent {
    pub kind: LineEventKind,
    pub source: EventSource,
    pub frame_position: i64,
}
