use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::packet::{Packet, PacketHeader, PacketType};

/// Split a payload into the sequence of packets that carries it on the wire.
///
/// Every packet repeats the rpc id, the fragment count and its own position,
///  so the receiver can reassemble from any arrival order. An empty payload
///  still produces one (empty) packet - something has to arrive for the RPC
///  to exist at the peer.
pub fn fragment_message(
    rpc_id: u64,
    packet_type: PacketType,
    payload: &[u8],
    max_payload: usize,
) -> Result<Vec<Packet>, RpcError> {
    let num_fragments = payload.len().div_ceil(max_payload).max(1);
    let total_packets: u16 = match num_fragments.try_into() {
        Ok(total) => total,
        Err(_) => return Err(RpcError::PayloadTooLarge { num_fragments }),
    };

    let payload = Bytes::copy_from_slice(payload);

    let mut packets = Vec::with_capacity(num_fragments);
    for seq_number in 0..total_packets {
        let start = seq_number as usize * max_payload;
        let end = (start + max_payload).min(payload.len());

        packets.push(Packet {
            header: PacketHeader {
                rpc_id,
                total_packets,
                seq_number,
                packet_type,
            },
            payload: payload.slice(start..end),
        });
    }
    Ok(packets)
}

/// A reassembly buffer is keyed by peer, rpc id and packet type, so that a
///  request and its response never mix even though they share an id.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct BufferKey {
    pub peer: SocketAddr,
    pub rpc_id: u64,
    pub packet_type: PacketType,
}

struct ReassemblyBuffer {
    total_packets: u16,
    fragments: FxHashMap<u16, Bytes>,
    first_seen: Instant,
}

impl ReassemblyBuffer {
    fn is_complete(&self) -> bool {
        self.fragments.len() == self.total_packets as usize
    }

    fn concatenate(&mut self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.fragments.values().map(Bytes::len).sum());
        for seq_number in 0..self.total_packets {
            payload.extend_from_slice(
                &self
                    .fragments
                    .remove(&seq_number)
                    .expect("complete buffer is missing a fragment"),
            );
        }
        payload
    }
}

/// Per-RPC buffers collecting fragments until a payload is complete. Owned
///  exclusively by the receive task, so no lock is needed.
pub struct ReassemblyBuffers {
    capacity: usize,
    timeout: Duration,
    buffers: FxHashMap<BufferKey, ReassemblyBuffer>,
    last_sweep: Option<Instant>,
}

impl ReassemblyBuffers {
    pub fn new(capacity: usize, timeout: Duration) -> ReassemblyBuffers {
        ReassemblyBuffers {
            capacity,
            timeout,
            buffers: FxHashMap::default(),
            last_sweep: None,
        }
    }

    /// Store one received fragment. Returns the complete payload once the last
    ///  missing fragment arrives, and `None` while the RPC is still
    ///  reassembling (or the packet was dropped as malformed).
    pub fn on_packet(&mut self, peer: SocketAddr, packet: Packet, now: Instant) -> Option<Vec<u8>> {
        self.maybe_sweep(now);

        let header = packet.header;

        if header.total_packets == 0 || header.seq_number >= header.total_packets {
            warn!(
                "fragment {}/{} of rpc {} from {:?} is out of range - dropping",
                header.seq_number, header.total_packets, header.rpc_id, peer
            );
            return None;
        }

        let key = BufferKey {
            peer,
            rpc_id: header.rpc_id,
            packet_type: header.packet_type,
        };

        let buffer = match self.buffers.get_mut(&key) {
            Some(buffer) => {
                if buffer.total_packets != header.total_packets {
                    warn!(
                        "fragment of rpc {} from {:?} announces {} total packets, buffer expects {} - dropping",
                        header.rpc_id, peer, header.total_packets, buffer.total_packets
                    );
                    return None;
                }
                buffer
            }
            None => {
                self.make_room();
                self.buffers.entry(key).or_insert(ReassemblyBuffer {
                    total_packets: header.total_packets,
                    fragments: FxHashMap::default(),
                    first_seen: now,
                })
            }
        };

        // duplicates for the same seq overwrite with the same bytes
        buffer.fragments.insert(header.seq_number, packet.payload);

        if buffer.is_complete() {
            let mut buffer = self.buffers.remove(&key).expect("buffer vanished");
            Some(buffer.concatenate())
        }
        else {
            None
        }
    }

    /// Amortized eviction: a full sweep costs a scan over all buffers, so it
    ///  runs at most every quarter timeout.
    fn maybe_sweep(&mut self, now: Instant) {
        let due = match self.last_sweep {
            Some(last_sweep) => now.duration_since(last_sweep) >= self.timeout / 4,
            None => true,
        };
        if due {
            self.last_sweep = Some(now);
            self.evict_expired(now);
        }
    }

    /// Discard incomplete buffers nobody has fed for too long.
    pub fn evict_expired(&mut self, now: Instant) {
        self.buffers.retain(|key, buffer| {
            let expired = now.duration_since(buffer.first_seen) > self.timeout;
            if expired {
                debug!(
                    "discarding stale reassembly buffer for rpc {} from {:?} ({} of {} fragments)",
                    key.rpc_id,
                    key.peer,
                    buffer.fragments.len(),
                    buffer.total_packets
                );
            }
            !expired
        });
    }

    fn make_room(&mut self) {
        while self.buffers.len() >= self.capacity {
            let oldest = self
                .buffers
                .iter()
                .min_by_key(|(_, buffer)| buffer.first_seen)
                .map(|(&key, _)| key);

            match oldest {
                Some(key) => {
                    debug!("reassembly buffers at capacity, evicting rpc {} from {:?}", key.rpc_id, key.peer);
                    self.buffers.remove(&key);
                }
                None => break,
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.buffers.len()
    }
}
