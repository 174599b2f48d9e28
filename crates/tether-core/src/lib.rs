//! Wire protocol and liveness bookkeeping shared by the tether hub and its clients.

pub mod client;
pub mod liveness;
pub mod packet;

pub use liveness::LivenessState;
pub use packet::{
    command_ok, decode_frame, encode_frame, read_packet, read_packet_buffered, send_packet,
    Command, FrameError, Packet, PacketError, ProtocolVersion, CURRENT_PROTOCOL_VERSION,
    DEFAULT_MAX_FRAME_BYTES,
};
