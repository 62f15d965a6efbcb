use thiserror::Error;

/// Failures surfaced to the caller of [`crate::client::Client::call`].
///
/// Server-side processing never surfaces errors to the peer: malformed or
/// unroutable requests are logged and dropped, and the client observes the
/// absence of a response as [`RpcError::Timeout`].
#[derive(Debug, Error)]
pub enum RpcError {
    /// No response arrived before the deadline, or the retry budget for the
    /// outbound packets was exhausted.
    #[error("call timed out")]
    Timeout,

    /// The call context was cancelled while the call was in flight.
    #[error("call was cancelled")]
    Cancelled,

    #[error("transport failure")]
    Transport(#[source] anyhow::Error),

    /// The response arrived but its frame or header section did not parse.
    #[error("malformed response")]
    MalformedResponse(#[source] anyhow::Error),

    /// An interceptor short-circuited the call.
    #[error("interceptor rejected the call")]
    Interceptor(#[source] anyhow::Error),

    /// Marshalling the request or unmarshalling the response failed.
    #[error("serializer failure")]
    Serializer(#[source] anyhow::Error),

    /// The payload would need more fragments than the wire format's u16
    /// sequence numbers can address.
    #[error("payload requires {num_fragments} fragments, exceeding the wire format limit")]
    PayloadTooLarge { num_fragments: usize },
}
