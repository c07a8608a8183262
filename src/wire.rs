//! Inter-rank wire format.
//!
//! Per epoch each rank sends one frame per peer: a fixed header followed by
//! the buffered events for that peer. All integers are little-endian with
//! fixed widths; the layout is part of the external contract and is framed
//! by hand so it cannot drift with a codec's encoding.
//!
//! ```text
//! header:  sender_rank u32 | epoch u64 | next_event_time u64 | event_count u32
//! event:   link_id u64 | delivery_time u64 | priority i32 | payload_len u32 | payload
//! ```

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::event::Event;
use crate::types::SimTime;

/// Fixed size of the frame header in bytes.
pub const HEADER_LEN: usize = 4 + 8 + 8 + 4;

/// Fixed size of an event record before its payload.
const EVENT_PREFIX_LEN: usize = 8 + 8 + 4 + 4;

/// Frame header exchanged between rank pairs each epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WireHeader {
    /// Rank that produced the frame
    pub sender_rank: u32,
    /// Epoch counter of the sender; peers advance in lockstep
    pub epoch: u64,
    /// Earliest pending event anywhere on the sender, for skip-ahead
    pub next_event_time: SimTime,
    /// Number of event records that follow
    pub event_count: u32,
}

/// Decode failures; a short read from a peer is fatal for the run.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("frame truncated: needed {needed} more bytes for the {context}")]
    Truncated {
        needed: usize,
        context: &'static str,
    },

    #[error("frame carries {trailing} trailing bytes past the last event")]
    TrailingBytes { trailing: usize },
}

/// Encodes a frame for one peer.
pub fn encode(header: &WireHeader, events: &[Event]) -> Vec<u8> {
    let payload_bytes: usize = events.iter().map(|ev| ev.payload.len()).sum();
    let mut buf = Vec::with_capacity(HEADER_LEN + events.len() * EVENT_PREFIX_LEN + payload_bytes);

    buf.put_u32_le(header.sender_rank);
    buf.put_u64_le(header.epoch);
    buf.put_u64_le(header.next_event_time);
    buf.put_u32_le(events.len() as u32);

    for ev in events {
        buf.put_u64_le(ev.link_id);
        buf.put_u64_le(ev.delivery_time);
        buf.put_i32_le(ev.priority);
        buf.put_u32_le(ev.payload.len() as u32);
        buf.put_slice(&ev.payload);
    }

    buf
}

/// Decodes a frame received from a peer.
pub fn decode(frame: &[u8]) -> Result<(WireHeader, Vec<Event>), WireError> {
    let mut buf = frame;

    if buf.remaining() < HEADER_LEN {
        return Err(WireError::Truncated {
            needed: HEADER_LEN - buf.remaining(),
            context: "header",
        });
    }
    let header = WireHeader {
        sender_rank: buf.get_u32_le(),
        epoch: buf.get_u64_le(),
        next_event_time: buf.get_u64_le(),
        event_count: buf.get_u32_le(),
    };

    let mut events = Vec::with_capacity(header.event_count as usize);
    for _ in 0..header.event_count {
        if buf.remaining() < EVENT_PREFIX_LEN {
            return Err(WireError::Truncated {
                needed: EVENT_PREFIX_LEN - buf.remaining(),
                context: "event record",
            });
        }
        let link_id = buf.get_u64_le();
        let delivery_time = buf.get_u64_le();
        let priority = buf.get_i32_le();
        let payload_len = buf.get_u32_le() as usize;

        if buf.remaining() < payload_len {
            return Err(WireError::Truncated {
                needed: payload_len - buf.remaining(),
                context: "event payload",
            });
        }
        let payload = buf.copy_to_bytes(payload_len).to_vec();

        events.push(Event {
            link_id,
            delivery_time,
            priority,
            payload,
        });
    }

    if buf.has_remaining() {
        return Err(WireError::TrailingBytes {
            trailing: buf.remaining(),
        });
    }

    Ok((header, events))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_events() -> Vec<Event> {
        vec![
            Event {
                link_id: 17,
                delivery_time: 200,
                priority: 0,
                payload: b"hello".to_vec(),
            },
            Event {
                link_id: 99,
                delivery_time: 250,
                priority: -3,
                payload: Vec::new(),
            },
        ]
    }

    #[test]
    fn test_round_trip_is_identity() {
        let header = WireHeader {
            sender_rank: 2,
            epoch: 41,
            next_event_time: 180,
            event_count: 2,
        };
        let events = sample_events();

        let frame = encode(&header, &events);
        let (decoded_header, decoded_events) = decode(&frame).unwrap();

        assert_eq!(decoded_header, header);
        assert_eq!(decoded_events, events);
    }

    #[test]
    fn test_empty_frame() {
        let header = WireHeader {
            sender_rank: 0,
            epoch: 1,
            next_event_time: crate::types::MAX_SIM_TIME,
            event_count: 0,
        };
        let frame = encode(&header, &[]);
        assert_eq!(frame.len(), HEADER_LEN);

        let (decoded, events) = decode(&frame).unwrap();
        assert_eq!(decoded, header);
        assert!(events.is_empty());
    }

    #[test]
    fn test_little_endian_layout() {
        let header = WireHeader {
            sender_rank: 1,
            epoch: 2,
            next_event_time: 3,
            event_count: 0,
        };
        let frame = encode(&header, &[]);
        assert_eq!(&frame[0..4], &[1, 0, 0, 0]);
        assert_eq!(&frame[4..12], &[2, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&frame[12..20], &[3, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_short_header_rejected() {
        let err = decode(&[0u8; 5]).unwrap_err();
        assert!(matches!(err, WireError::Truncated { context: "header", .. }));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let header = WireHeader {
            sender_rank: 0,
            epoch: 1,
            next_event_time: 10,
            event_count: 1,
        };
        let frame = encode(&header, &sample_events()[..1]);
        let err = decode(&frame[..frame.len() - 2]).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let header = WireHeader {
            sender_rank: 0,
            epoch: 1,
            next_event_time: 10,
            event_count: 0,
        };
        let mut frame = encode(&header, &[]);
        frame.push(0xFF);
        assert!(matches!(
            decode(&frame).unwrap_err(),
            WireError::TrailingBytes { trailing: 1 }
        ));
    }
}
