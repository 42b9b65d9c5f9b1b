#![no_std]

//! Kernel/user ABI for the run queue probes.
//!
//! The probe object loaded at runtime must emit records with exactly this
//! layout into the ring buffer named [`EVENTS_MAP`].

/// Ring buffer map carrying [`RunQueueEvent`] records.
pub const EVENTS_MAP: &str = "events";

/// `tp_btf/sched_wakeup` program: stamps the enqueue time per pid.
pub const SCHED_WAKEUP_PROGRAM: &str = "tp_sched_wakeup";

/// `tp_btf/sched_switch` program: computes latency and submits the record.
pub const SCHED_SWITCH_PROGRAM: &str = "tp_sched_switch";

/// Size of one record on the wire.
pub const RUNQ_EVENT_SIZE: usize = 32;

/// One scheduling switch with the run queue latency of the incoming task.
///
/// All fields are little-endian `u64` in declaration order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunQueueEvent {
    /// cgroup of the task switched out, 0 when unknown.
    pub prev_cgroup_id: u64,
    /// cgroup of the task switched in.
    pub cgroup_id: u64,
    /// Time the incoming task spent runnable but not running.
    pub runq_latency_ns: u64,
    /// `bpf_ktime_get_ns()` at emission.
    pub timestamp_ns: u64,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for RunQueueEvent {}

const _: () = {
    assert!(
        core::mem::size_of::<RunQueueEvent>() == RUNQ_EVENT_SIZE,
        "RunQueueEvent must be exactly 32 bytes"
    );
    assert!(
        core::mem::align_of::<RunQueueEvent>() == 8,
        "RunQueueEvent must be 8-byte aligned"
    );
};
