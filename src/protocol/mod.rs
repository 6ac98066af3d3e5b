//! Wire protocol: envelopes, framing, and the method allow-list.

pub mod codec;
pub mod methods;

pub use codec::{encode, ErrorBody, FrameDecoder, FrameError, Request, Response, PROTOCOL_VERSION};
pub use methods::Method;
