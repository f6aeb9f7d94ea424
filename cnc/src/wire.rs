//! Wire protocol (§6): one `u8` discriminant per message kind, followed by a
//! kind-specific body. Discriminant values are carried over unchanged from
//! the `IC` namespace's item-collection message kinds and the `DISTRED`
//! namespace's reduction message kinds, since nothing depends on them
//! beyond "closed and fully enumerated" (§7).
//!
//! Every message type here implements [`Codec`] itself, so a
//! [`crate::item::collection::ItemCollection`] or
//! [`crate::reduction::ReductionGraph`] can hand a message straight to an
//! [`Encoder`]/[`Decoder`] without a separate framing step; the
//! [`cnc_communication::dispatch::Switchboard`] id-prefix framing happens
//! one layer above this module.

use cnc_bytes::{Codec, Decoder, Encoder};

use crate::tag::{Tag, Value};

pub mod ic_kind {
    pub const REQUEST: u8 = 0;
    pub const DELIVER: u8 = 1;
    pub const DELIVER_TO_OWN: u8 = 2;
    pub const ERASE: u8 = 3;
    pub const GET_COUNTS: u8 = 4;
    pub const PROBE: u8 = 5;
    pub const UNAVAIL: u8 = 6;
    pub const GATHER_REQ: u8 = 7;
    pub const GATHER_RES: u8 = 8;
    pub const RESET: u8 = 9;
}

pub mod sched_kind {
    pub const PING: u8 = 0;
    pub const PONG: u8 = 1;
    pub const DONE: u8 = 2;
}

pub mod reduce_kind {
    pub const BCASTCOUNT: u8 = 93;
    pub const GATHERCOUNT: u8 = 94;
    pub const DONE: u8 = 95;
    pub const ALLDONE: u8 = 96;
    pub const VALUE: u8 = 97;
    pub const ALLVALUES: u8 = 98;
}

pub mod step_kind {
    pub const SHIP: u8 = 0;
}

/// A step instance shipped to the process `compute_on` selected (§4.2
/// "prepare": "If `compute_on` selects a remote pid, the step is shipped and
/// removed locally"). The remote process holds the identical step
/// collection (same id, same body and tuner, SPMD-style), so only the tag
/// needs to cross the wire; the receiving process prescribes a fresh local
/// instance from it exactly as if its own environment had called `put`.
#[derive(Clone, Debug)]
pub enum StepMessage<T> {
    Ship { tag: T },
}

impl<T: Tag> StepMessage<T> {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        match self {
            StepMessage::Ship { tag } => {
                enc.write_u8(step_kind::SHIP);
                enc.write(tag);
            }
        }
        enc.into_vec()
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let mut dec = Decoder::new(bytes);
        match dec.read_u8() {
            step_kind::SHIP => StepMessage::Ship { tag: dec.read() },
            other => panic!("cnc: unrecognized step message kind {other}; the wire protocol is closed and fully enumerated"),
        }
    }

    /// A human-readable kind tag, used only for logging (`CommEvent`).
    pub fn kind_name(&self) -> &'static str {
        match self {
            StepMessage::Ship { .. } => "SHIP",
        }
    }
}

/// Messages an item collection's [`crate::item::collection::ItemCollection`]
/// sends and receives over the wire (§4.1 "Message kinds", §6 wire table).
#[derive(Clone, Debug)]
pub enum ItemMessage<T, V> {
    Request { tag: T, requester_pid: u32 },
    Probe { tag: T, requester_pid: u32 },
    Deliver { owner_pid: u32, tag: T, value: V },
    DeliverToOwn { tag: T, value: V },
    Unavail,
    GatherReq { sender_pid: u32 },
    GatherRes { owner_pid: u32, items: Vec<(T, V)> },
    GetCounts { sender_pid: u32, tags: Vec<T>, safe_flag: u8 },
    Erase { tags: Vec<T>, safe_flag: u8 },
    Reset,
}

impl<T: Tag, V: Value> ItemMessage<T, V> {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        match self {
            ItemMessage::Request { tag, requester_pid } => {
                enc.write_u8(ic_kind::REQUEST);
                enc.write(tag);
                enc.write_u32(*requester_pid);
            }
            ItemMessage::Probe { tag, requester_pid } => {
                enc.write_u8(ic_kind::PROBE);
                enc.write(tag);
                enc.write_u32(*requester_pid);
            }
            ItemMessage::Deliver { owner_pid, tag, value } => {
                enc.write_u8(ic_kind::DELIVER);
                enc.write_u32(*owner_pid);
                enc.write(tag);
                enc.write(value);
            }
            ItemMessage::DeliverToOwn { tag, value } => {
                enc.write_u8(ic_kind::DELIVER_TO_OWN);
                enc.write(tag);
                enc.write(value);
            }
            ItemMessage::Unavail => {
                enc.write_u8(ic_kind::UNAVAIL);
            }
            ItemMessage::GatherReq { sender_pid } => {
                enc.write_u8(ic_kind::GATHER_REQ);
                enc.write_u32(*sender_pid);
            }
            ItemMessage::GatherRes { owner_pid, items } => {
                enc.write_u8(ic_kind::GATHER_RES);
                enc.write_u32(*owner_pid);
                enc.write(items);
            }
            ItemMessage::GetCounts { sender_pid, tags, safe_flag } => {
                enc.write_u8(ic_kind::GET_COUNTS);
                enc.write_u32(*sender_pid);
                enc.write(tags);
                enc.write_u8(*safe_flag);
            }
            ItemMessage::Erase { tags, safe_flag } => {
                enc.write_u8(ic_kind::ERASE);
                enc.write(tags);
                enc.write_u8(*safe_flag);
            }
            ItemMessage::Reset => {
                enc.write_u8(ic_kind::RESET);
            }
        }
        enc.into_vec()
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let mut dec = Decoder::new(bytes);
        let kind = dec.read_u8();
        match kind {
            ic_kind::REQUEST => ItemMessage::Request { tag: dec.read(), requester_pid: dec.read_u32() },
            ic_kind::PROBE => ItemMessage::Probe { tag: dec.read(), requester_pid: dec.read_u32() },
            ic_kind::DELIVER => {
                let owner_pid = dec.read_u32();
                let tag = dec.read();
                let value = dec.read();
                ItemMessage::Deliver { owner_pid, tag, value }
            }
            ic_kind::DELIVER_TO_OWN => ItemMessage::DeliverToOwn { tag: dec.read(), value: dec.read() },
            ic_kind::UNAVAIL => ItemMessage::Unavail,
            ic_kind::GATHER_REQ => ItemMessage::GatherReq { sender_pid: dec.read_u32() },
            ic_kind::GATHER_RES => {
                let owner_pid = dec.read_u32();
                let items = dec.read();
                ItemMessage::GatherRes { owner_pid, items }
            }
            ic_kind::GET_COUNTS => {
                let sender_pid = dec.read_u32();
                let tags = dec.read();
                let safe_flag = dec.read_u8();
                ItemMessage::GetCounts { sender_pid, tags, safe_flag }
            }
            ic_kind::ERASE => {
                let tags = dec.read();
                let safe_flag = dec.read_u8();
                ItemMessage::Erase { tags, safe_flag }
            }
            ic_kind::RESET => ItemMessage::Reset,
            other => panic!("cnc: unrecognized item-collection message kind {other}; the wire protocol is closed and fully enumerated"),
        }
    }

    /// A human-readable kind tag, used only for logging (`CommEvent`).
    pub fn kind_name(&self) -> &'static str {
        match self {
            ItemMessage::Request { .. } => "REQUEST",
            ItemMessage::Probe { .. } => "PROBE",
            ItemMessage::Deliver { .. } => "DELIVER",
            ItemMessage::DeliverToOwn { .. } => "DELIVER_TO_OWN",
            ItemMessage::Unavail => "UNAVAIL",
            ItemMessage::GatherReq { .. } => "GATHER_REQ",
            ItemMessage::GatherRes { .. } => "GATHER_RES",
            ItemMessage::GetCounts { .. } => "GET_COUNTS",
            ItemMessage::Erase { .. } => "ERASE",
            ItemMessage::Reset => "RESET",
        }
    }
}

/// Scheduler-level quiescence messages (§4.3).
#[derive(Clone, Copy, Debug)]
pub enum SchedulerMessage {
    Ping { root_pid: u32 },
    Pong,
    Done,
}

impl SchedulerMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        match self {
            SchedulerMessage::Ping { root_pid } => {
                enc.write_u8(sched_kind::PING);
                enc.write_u32(*root_pid);
            }
            SchedulerMessage::Pong => enc.write_u8(sched_kind::PONG),
            SchedulerMessage::Done => enc.write_u8(sched_kind::DONE),
        }
        enc.into_vec()
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let mut dec = Decoder::new(bytes);
        match dec.read_u8() {
            sched_kind::PING => SchedulerMessage::Ping { root_pid: dec.read_u32() },
            sched_kind::PONG => SchedulerMessage::Pong,
            sched_kind::DONE => SchedulerMessage::Done,
            other => panic!("cnc: unrecognized scheduler message kind {other}"),
        }
    }
}

/// Reduction fan-in messages (§4.4).
#[derive(Clone, Debug)]
pub enum ReduceMessage<O, V> {
    BcastCount { out_tag: O, owner_pid: u32, count: i64 },
    GatherCount { out_tag: O, count: i64 },
    Done { out_tag: O, owner_pid: u32 },
    Value { out_tag: O, value: V },
    AllDone,
    AllValues { values: Vec<(O, V)> },
}

impl<O: Tag, V: Value> ReduceMessage<O, V> {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        match self {
            ReduceMessage::BcastCount { out_tag, owner_pid, count } => {
                enc.write_u8(reduce_kind::BCASTCOUNT);
                enc.write(out_tag);
                enc.write_u32(*owner_pid);
                enc.write_i64(*count);
            }
            ReduceMessage::GatherCount { out_tag, count } => {
                enc.write_u8(reduce_kind::GATHERCOUNT);
                enc.write(out_tag);
                enc.write_i64(*count);
            }
            ReduceMessage::Done { out_tag, owner_pid } => {
                enc.write_u8(reduce_kind::DONE);
                enc.write(out_tag);
                enc.write_u32(*owner_pid);
            }
            ReduceMessage::Value { out_tag, value } => {
                enc.write_u8(reduce_kind::VALUE);
                enc.write(out_tag);
                enc.write(value);
            }
            ReduceMessage::AllDone => enc.write_u8(reduce_kind::ALLDONE),
            ReduceMessage::AllValues { values } => {
                enc.write_u8(reduce_kind::ALLVALUES);
                enc.write(values);
            }
        }
        enc.into_vec()
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let mut dec = Decoder::new(bytes);
        match dec.read_u8() {
            reduce_kind::BCASTCOUNT => {
                let out_tag = dec.read();
                let owner_pid = dec.read_u32();
                let count = dec.read_i64();
                ReduceMessage::BcastCount { out_tag, owner_pid, count }
            }
            reduce_kind::GATHERCOUNT => {
                let out_tag = dec.read();
                let count = dec.read_i64();
                ReduceMessage::GatherCount { out_tag, count }
            }
            reduce_kind::DONE => {
                let out_tag = dec.read();
                let owner_pid = dec.read_u32();
                ReduceMessage::Done { out_tag, owner_pid }
            }
            reduce_kind::VALUE => {
                let out_tag = dec.read();
                let value = dec.read();
                ReduceMessage::Value { out_tag, value }
            }
            reduce_kind::ALLDONE => ReduceMessage::AllDone,
            reduce_kind::ALLVALUES => ReduceMessage::AllValues { values: dec.read() },
            other => panic!("cnc: unrecognized reduction message kind {other}"),
        }
    }

    /// A human-readable kind tag, used only for logging (`CommEvent`).
    pub fn kind_name(&self) -> &'static str {
        match self {
            ReduceMessage::BcastCount { .. } => "BCASTCOUNT",
            ReduceMessage::GatherCount { .. } => "GATHERCOUNT",
            ReduceMessage::Done { .. } => "DONE",
            ReduceMessage::Value { .. } => "VALUE",
            ReduceMessage::AllDone => "ALLDONE",
            ReduceMessage::AllValues { .. } => "ALLVALUES",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_message_round_trips() {
        let msg: ItemMessage<u32, i64> = ItemMessage::Deliver { owner_pid: 3, tag: 42, value: -9 };
        let bytes = msg.encode();
        match ItemMessage::decode(&bytes) {
            ItemMessage::Deliver { owner_pid, tag, value } => {
                assert_eq!(owner_pid, 3);
                assert_eq!(tag, 42);
                assert_eq!(value, -9);
            }
            other => panic!("unexpected decode {other:?}"),
        }
    }

    #[test]
    fn scheduler_message_round_trips() {
        let bytes = SchedulerMessage::Ping { root_pid: 0 }.encode();
        match SchedulerMessage::decode(&bytes) {
            SchedulerMessage::Ping { root_pid } => assert_eq!(root_pid, 0),
            other => panic!("unexpected decode {other:?}"),
        }
    }

    #[test]
    fn step_message_round_trips() {
        let msg: StepMessage<u32> = StepMessage::Ship { tag: 17 };
        let bytes = msg.encode();
        match StepMessage::decode(&bytes) {
            StepMessage::Ship { tag } => assert_eq!(tag, 17),
        }
    }

    #[test]
    fn reduce_message_round_trips() {
        let msg: ReduceMessage<u32, i64> = ReduceMessage::BcastCount { out_tag: 0, owner_pid: 1, count: 16 };
        let bytes = msg.encode();
        match ReduceMessage::decode(&bytes) {
            ReduceMessage::BcastCount { out_tag, owner_pid, count } => {
                assert_eq!(out_tag, 0);
                assert_eq!(owner_pid, 1);
                assert_eq!(count, 16);
            }
            other => panic!("unexpected decode {other:?}"),
        }
    }
}
