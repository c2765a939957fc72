pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod frame;
pub mod group;
pub mod output;
pub mod shutdown;
pub mod socket;
pub mod socket_id;
pub mod stream;
pub mod transport;

mod deferred;
mod input;
mod mux;
mod protocol;
mod registry;

pub use codec::FrameCodec;
pub use config::{Config, ConfigBuilder};
pub use control::{ControlCodec, ControlMessage};
pub use error::{MuxError, Result};
pub use frame::{Frame, FrameHeader, HEADER_SIZE, PROTOCOL_VERSION, Segment};
pub use group::{ConnectionGroup, DeadLetterStats, GroupId, Reservation};
pub use mux::Mux;
pub use output::Bracket;
pub use shutdown::ShutdownPhase;
pub use socket::{Acceptor, VirtualSocket};
pub use socket_id::{SocketId, SocketIdAllocator};
pub use stream::{VirtualInputStream, VirtualOutputStream};
pub use transport::{AsyncTransport, BlockingTransport, Transport};
