//! A lightweight request/response RPC runtime over plain UDP datagrams, for
//!  service-to-service calls inside a cluster where the wire format, the
//!  fragmentation strategy and the middleware pipeline should be under the
//!  application's control rather than inherited from a heavyweight stack.
//!
//! ## Design goals
//!
//! * The abstraction is a single request paired with a single response,
//!   correlated by a 64-bit id the caller chooses and the peer echoes
//! * Payloads of arbitrary size are carried without IP-level fragmentation -
//!   the runtime splits them into bounded datagrams and reassembles them at
//!   the peer, from any arrival order
//! * Delivery is best-effort with idempotent retransmission: unacknowledged
//!   RPCs are re-sent on a fixed interval until a response (or ACK) is
//!   observed, the retry budget runs out, or the deadline passes. The
//!   receiving side suppresses duplicate deliveries, so a handler runs at
//!   most once per request id
//! * Calls carry multi-valued header metadata in both directions, and pass
//!   through an interceptor chain (forward order on requests, reverse order
//!   on responses) that may observe or rewrite the envelope
//! * Explicitly *not* provided: ordered streaming, flow control, congestion
//!   control, encryption, exactly-once semantics --> different trade-offs
//!
//! ## Wire format
//!
//! Packet header (inside a UDP datagram) - all numbers little-endian:
//! ```ascii
//! 0:  rpc id (u64): correlation id, unique per sender for the lifetime of
//!      any buffer that might still hold it
//! 8:  total packets (u16): number of fragments the payload was split into
//! 10: sequence number (u16): this fragment's position, 0-based
//! 12: packet type (u8): 0=REQUEST 1=RESPONSE 2=ACK
//! *:  payload bytes - whatever fits the configured datagram size
//! ```
//!
//! A reassembled REQUEST or RESPONSE payload carries an application frame:
//! ```ascii
//! 0: service name (u16 length prefix + UTF-8 bytes)
//! *: method name (u16 length prefix + UTF-8 bytes)
//! *: header section (u16 length prefix + encoded metadata)
//! *: user payload - everything up to the end of the frame
//! ```
//!
//! ACK packets carry no payload: one ACK confirms full receipt of the RPC it
//!  names, letting the peer drop the pending entry early. Losing an ACK only
//!  costs a redundant retransmission.
//!
//! ## Layering
//!
//! [`endpoint::RpcEndpoint`] owns a socket and runs the protocol: packet
//!  codec, fragmentation and reassembly, retransmission, duplicate
//!  suppression. [`server::Server`] adds a service/method registry and the
//!  dispatch pipeline on the inbound side; [`client::Client`] adds the
//!  synchronous call surface on the outbound side. Serialization and address
//!  resolution are pluggable at the edges ([`serializer::Serializer`],
//!  [`resolver::Resolver`]).

pub mod client;
pub mod config;
pub mod context;
pub mod correlation;
pub mod endpoint;
pub mod error;
pub mod fragmentation;
pub mod frame;
pub mod interceptor;
pub mod metadata;
pub mod packet;
pub mod resolver;
pub mod retransmit;
pub mod serializer;
pub mod server;
pub mod service;
pub mod transport;

pub use client::Client;
pub use config::RpcConfig;
pub use context::{CallContext, CancelHandle};
pub use error::RpcError;
pub use interceptor::{Interceptor, RpcRequest, RpcResponse};
pub use metadata::Metadata;
pub use serializer::{JsonSerializer, Serializer};
pub use server::Server;
pub use service::{typed_handler, MethodHandler, ServiceDesc};

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
