//! Control-channel protocol shared by the plant and the controller service.

pub mod factory;
pub mod message;
pub mod value;

pub use factory::MessageFactory;
pub use message::{ControlMessage, MessageKind, ParseError};
pub use value::{PropValue, PropertyMap};

/// Largest datagram either side expects to receive.
pub const MAX_DATAGRAM: usize = 64 * 1024;
