use std::time::Duration;

use anyhow::bail;

use crate::packet::PacketHeader;

/// Tuning knobs for an RPC endpoint. Client and server share the same set;
///  both sides of a deployment should run with compatible values (most
///  importantly [`RpcConfig::max_datagram_size`]).
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// The UDP payload size the protocol assumes. Packets are never larger
    ///  than this, so the value (plus UDP/IP overhead) must fit the MTU of
    ///  every link between peers.
    ///
    /// In an ideal world, we would discover the MTU and derive this value
    ///  from it, but discovery does not work reliably across arbitrary
    ///  network hardware. The application carries the responsibility instead.
    ///  With full Ethernet frames and no optional IP headers this is
    ///  `1500 - 20 - 8 = 1472` for IPV4.
    pub max_datagram_size: usize,

    /// Interval at which unacknowledged outbound RPCs are retransmitted.
    pub retry_interval: Duration,

    /// Total number of transmissions (initial send included) before an
    ///  outbound RPC is given up on.
    pub max_attempts: u32,

    /// Upper bound on the time an outbound RPC may stay pending. Also caps
    ///  the per-call timeout passed to `call`.
    pub call_deadline: Duration,

    /// Incomplete reassembly buffers older than this are discarded without
    ///  delivery.
    pub reassembly_timeout: Duration,

    /// Maximum number of concurrent reassembly buffers; the oldest buffer is
    ///  evicted on overflow.
    pub reassembly_buffer_capacity: usize,

    /// Maximum number of concurrently pending outbound RPCs; the oldest entry
    ///  is evicted (failing its caller with a timeout) on overflow.
    pub pending_rpc_capacity: usize,

    /// Bound on the per-direction record of already-delivered RPC ids.
    pub seen_id_capacity: usize,

    /// Seen-id entries older than this are forgotten even if the capacity is
    ///  not exhausted.
    pub seen_id_max_age: Duration,
}

impl RpcConfig {
    /// Defaults for IPV4 peers connected by full-MTU Ethernet without
    ///  optional IP headers.
    pub fn default_ipv4() -> RpcConfig {
        RpcConfig {
            max_datagram_size: 1472,
            retry_interval: Duration::from_millis(500),
            max_attempts: 5,
            call_deadline: Duration::from_secs(10),
            reassembly_timeout: Duration::from_secs(30),
            reassembly_buffer_capacity: 1024,
            pending_rpc_capacity: 1024,
            seen_id_capacity: 10_000,
            seen_id_max_age: Duration::from_secs(60),
        }
    }

    /// The biggest packet body that fits a datagram next to the packet header.
    pub fn max_payload(&self) -> usize {
        self.max_datagram_size - PacketHeader::SERIALIZED_LEN
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size <= PacketHeader::SERIALIZED_LEN {
            bail!("max_datagram_size {} cannot carry any payload", self.max_datagram_size);
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.retry_interval.is_zero() {
            bail!("retry_interval must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::defaults(RpcConfig::default_ipv4(), true)]
    #[case::tiny_datagram(RpcConfig { max_datagram_size: 13, ..RpcConfig::default_ipv4() }, false)]
    #[case::no_attempts(RpcConfig { max_attempts: 0, ..RpcConfig::default_ipv4() }, false)]
    #[case::zero_interval(RpcConfig { retry_interval: Duration::ZERO, ..RpcConfig::default_ipv4() }, false)]
    fn test_validate(#[case] config: RpcConfig, #[case] expected_ok: bool) {
        assert_eq!(config.validate().is_ok(), expected_ok);
    }

    #[rstest]
    fn test_max_payload() {
        let config = RpcConfig::default_ipv4();
        assert_eq!(config.max_payload(), 1472 - 13);
    }
}
