//! Decoding of raw ring buffer records into [`RunQueueEvent`] values.
//!
//! The layout is fixed little-endian regardless of host byte order, so a
//! record captured on one machine decodes the same way everywhere. The length
//! check happens once up front; a short record never yields a partial event.

pub use runqwatch_common::{RUNQ_EVENT_SIZE, RunQueueEvent};

use crate::error::DecodeError;

const PREV_CGROUP_ID_OFFSET: usize = 0;
const CGROUP_ID_OFFSET: usize = 8;
const RUNQ_LATENCY_OFFSET: usize = 16;
const TIMESTAMP_OFFSET: usize = 24;

/// Parse one record. Bytes past [`RUNQ_EVENT_SIZE`] are ignored.
pub fn decode(data: &[u8]) -> Result<RunQueueEvent, DecodeError> {
    let Some(record) = data.first_chunk::<RUNQ_EVENT_SIZE>() else {
        return Err(DecodeError::Truncated {
            size: data.len(),
            expected: RUNQ_EVENT_SIZE,
        });
    };

    Ok(RunQueueEvent {
        prev_cgroup_id: read_u64_le(record, PREV_CGROUP_ID_OFFSET),
        cgroup_id: read_u64_le(record, CGROUP_ID_OFFSET),
        runq_latency_ns: read_u64_le(record, RUNQ_LATENCY_OFFSET),
        timestamp_ns: read_u64_le(record, TIMESTAMP_OFFSET),
    })
}

/// Inverse of [`decode`]; produces the bytes the probe would submit.
pub fn encode(event: &RunQueueEvent) -> [u8; RUNQ_EVENT_SIZE] {
    let mut out = [0u8; RUNQ_EVENT_SIZE];
    out[PREV_CGROUP_ID_OFFSET..CGROUP_ID_OFFSET]
        .copy_from_slice(&event.prev_cgroup_id.to_le_bytes());
    out[CGROUP_ID_OFFSET..RUNQ_LATENCY_OFFSET].copy_from_slice(&event.cgroup_id.to_le_bytes());
    out[RUNQ_LATENCY_OFFSET..TIMESTAMP_OFFSET]
        .copy_from_slice(&event.runq_latency_ns.to_le_bytes());
    out[TIMESTAMP_OFFSET..].copy_from_slice(&event.timestamp_ns.to_le_bytes());
    out
}

#[inline(always)]
fn read_u64_le(record: &[u8; RUNQ_EVENT_SIZE], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&record[offset..offset + 8]);
    u64::from_le_bytes(buf)
}
