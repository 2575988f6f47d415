pub mod protocol;

pub use protocol::{
    encode_server_message, parse_client_message, AckUpdate, ClientMessage, ProtocolError,
    ServerMessage, Update, WakeupHostport, MAX_MESSAGE_BYTES,
};
