//! The group-messaging transport capability required by §4.1: process
//! groups, tag-filtered intra-group send/recv/probe, inter-group
//! connect/accept via named ports, broadcast, barrier, spawn and
//! disconnect.
//!
//! A [`GroupHandle`] is a rank's own view of a group: an ordered table of
//! peers (ordered by join order, matching "credit counters ordered by
//! consumer rank" in §3) plus this rank's own inbox. Members reachable
//! in-process push directly into each other's inbox (this is how the
//! catalog/runtime/module daemons are wired together in tests, and is a
//! faithful model of the protocol without needing to fork real OS
//! processes for every test); members reached over the network instead
//! hold a [`tcp::RemoteLink`] that pumps bytes to/from a `TcpStream` using
//! the wire format in [`crate::message`].

pub mod tcp;

use std::collections::VecDeque;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::constants::COMM_ANY_SOURCE;
use crate::error::{Result, WatershedError};
use crate::message::{Message, OpCode};

/// One message, tagged with the rank it arrived from.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: i32,
    pub message: Message,
}

/// A rank's inbound mailbox: a FIFO-per-match queue. Non-blocking `try_take`
/// implements `Probe`+immediate `Receive`; `take` is the suspending form
/// used when the dispatcher needs to wait for a specific announcement.
#[derive(Default)]
pub struct Inbox {
    queue: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

impl Inbox {
    fn push(&self, envelope: Envelope) {
        self.queue.lock().push_back(envelope);
        self.notify.notify_waiters();
    }

    /// Non-blocking: returns `None` ("-1") when nothing pending matches.
    pub fn try_take(&self, source: i32, op_filter: OpCode) -> Option<Envelope> {
        let mut queue = self.queue.lock();
        let position = queue
            .iter()
            .position(|e| (source == COMM_ANY_SOURCE || source == e.from) && e.message.matches(op_filter))?;
        queue.remove(position)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub async fn take(&self, source: i32, op_filter: OpCode) -> Envelope {
        loop {
            let notified = self.notify.notified();
            if let Some(envelope) = self.try_take(source, op_filter) {
                return envelope;
            }
            notified.await;
        }
    }
}

/// How a peer rank is reached: in the same process (push straight into its
/// inbox) or over the network (pump bytes through a socket).
enum MemberLink {
    Local(Arc<Inbox>),
    Remote(tcp::RemoteLink),
}

struct BarrierState {
    arrived: Mutex<usize>,
    generation: Mutex<u64>,
    notify: Notify,
}

impl BarrierState {
    fn new() -> Self {
        BarrierState {
            arrived: Mutex::new(0),
            generation: Mutex::new(0),
            notify: Notify::new(),
        }
    }
}

/// A rank's handle onto one process group. Cheaply `Clone`-able; the
/// exclusion lock mandated by §5 is the internal `RwLock` over the member
/// table, acquired for the duration of each non-blocking operation and
/// never held across an `.await`.
#[derive(Clone)]
pub struct GroupHandle {
    members: Arc<RwLock<IndexMap<i32, MemberLink>>>,
    own_inbox: Arc<Inbox>,
    self_rank: i32,
    barrier: Arc<BarrierState>,
}

impl GroupHandle {
    /// Creates a new group containing only `self_rank`. Use [`join_local`]
    /// / [`join_remote`] to add peers (e.g. as `spawn`/`connect`/`accept`
    /// complete).
    pub fn solo(self_rank: i32) -> Self {
        let own_inbox = Arc::new(Inbox::default());
        let mut members = IndexMap::new();
        members.insert(self_rank, MemberLink::Local(own_inbox.clone()));
        GroupHandle {
            members: Arc::new(RwLock::new(members)),
            own_inbox,
            self_rank,
            barrier: Arc::new(BarrierState::new()),
        }
    }

    pub fn self_rank(&self) -> i32 {
        self.self_rank
    }

    /// The ranks of every member (including self), in join order.
    pub fn ranks(&self) -> Vec<i32> {
        self.members.read().keys().copied().collect()
    }

    pub fn peer_ranks(&self) -> Vec<i32> {
        self.ranks().into_iter().filter(|r| *r != self.self_rank).collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    /// Joins `other`'s process as a local peer sharing the same inbox
    /// object — used when two participants live in the same OS process
    /// (as every daemon does in this crate's test suite).
    pub fn join_local(&self, rank: i32, inbox: Arc<Inbox>) {
        self.members.write().insert(rank, MemberLink::Local(inbox));
    }

    pub fn join_remote(&self, rank: i32, link: tcp::RemoteLink) {
        self.members.write().insert(rank, MemberLink::Remote(link));
    }

    /// Returns a handle for `rank` that can be handed to a peer so it can
    /// reach back into this group (used by in-process spawn/connect).
    pub fn own_inbox(&self) -> Arc<Inbox> {
        self.own_inbox.clone()
    }

    pub fn send(&self, to: i32, message: Message) -> Result<()> {
        let members = self.members.read();
        match members.get(&to) {
            Some(MemberLink::Local(inbox)) => {
                inbox.push(Envelope {
                    from: self.self_rank,
                    message,
                });
                Ok(())
            }
            Some(MemberLink::Remote(link)) => link.send(message),
            None => Err(WatershedError::BadParameter(format!(
                "rank {to} is not a member of this group"
            ))),
        }
    }

    pub fn broadcast(&self, message: Message) -> Result<()> {
        let targets: Vec<i32> = self.peer_ranks();
        for rank in targets {
            self.send(rank, message.clone())?;
        }
        Ok(())
    }

    /// Non-blocking probe+receive: `COMM_ANY_SOURCE` / `OpCode::Any` match
    /// any sender/tag. Returns `None` when nothing pending matches.
    pub fn try_recv(&self, source: i32, op_filter: OpCode) -> Option<(i32, Message)> {
        self.own_inbox
            .try_take(source, op_filter)
            .map(|e| (e.from, e.message))
    }

    pub async fn recv(&self, source: i32, op_filter: OpCode) -> (i32, Message) {
        let envelope = self.own_inbox.take(source, op_filter).await;
        (envelope.from, envelope.message)
    }

    pub fn is_empty(&self) -> bool {
        self.own_inbox.is_empty()
    }

    /// Collective barrier across every current member. Uses a generation
    /// counter rather than a fixed-size `tokio::sync::Barrier` because
    /// `RemoveInstance` can shrink the group between rounds.
    pub async fn barrier(&self) {
        let expected = self.member_count();
        let my_generation = {
            let mut arrived = self.barrier.arrived.lock();
            *arrived += 1;
            if *arrived >= expected {
                *arrived = 0;
                let mut generation = self.barrier.generation.lock();
                *generation += 1;
                self.barrier.notify.notify_waiters();
                return;
            }
            *self.barrier.generation.lock()
        };
        loop {
            let notified = self.barrier.notify.notified();
            if *self.barrier.generation.lock() != my_generation {
                return;
            }
            notified.await;
        }
    }

    /// Removes `rank` from this group's member table: full exclusion from
    /// the handle is authoritative, so the removed rank no longer appears
    /// in `ranks()` and no longer receives broadcasts.
    pub fn remove_rank(&self, rank: i32) {
        self.members.write().shift_remove(&rank);
    }

    /// Collective, followed by dropping the handle; matches the
    /// transport's `disconnect` primitive (§4.1).
    pub async fn disconnect(&self) {
        self.barrier().await;
        self.members.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::OpCode;

    fn wire_pair(rank_a: i32, rank_b: i32) -> (GroupHandle, GroupHandle) {
        let a = GroupHandle::solo(rank_a);
        let b = GroupHandle::solo(rank_b);
        a.join_local(rank_b, b.own_inbox());
        b.join_local(rank_a, a.own_inbox());
        (a, b)
    }

    #[tokio::test]
    async fn send_and_receive_round_trips() {
        let (a, b) = wire_pair(0, 1);
        a.send(1, Message::new(OpCode::ModuleData, b"hi".to_vec()).unwrap())
            .unwrap();
        let (from, msg) = b.recv(COMM_ANY_SOURCE, OpCode::Any).await;
        assert_eq!(from, 0);
        assert_eq!(msg.payload, b"hi");
    }

    #[tokio::test]
    async fn probe_returns_none_when_nothing_pending() {
        let (_a, b) = wire_pair(0, 1);
        assert!(b.try_recv(COMM_ANY_SOURCE, OpCode::Any).is_none());
    }

    #[tokio::test]
    async fn op_filter_preserves_order_of_non_matching_messages() {
        let (a, b) = wire_pair(0, 1);
        a.send(1, Message::new(OpCode::CreditAnnouncement, vec![]).unwrap())
            .unwrap();
        a.send(1, Message::new(OpCode::ModuleData, b"payload".to_vec()).unwrap())
            .unwrap();

        // Selective receive of ModuleData first, leaving the credit
        // announcement in place for a later take.
        let (_, data) = b.recv(COMM_ANY_SOURCE, OpCode::ModuleData).await;
        assert_eq!(data.payload, b"payload");
        let (_, credit) = b.recv(COMM_ANY_SOURCE, OpCode::CreditAnnouncement).await;
        assert_eq!(credit.op_code, OpCode::CreditAnnouncement);
    }

    #[tokio::test]
    async fn barrier_releases_all_members_together() {
        let a = GroupHandle::solo(0);
        let b = GroupHandle::solo(1);
        let c = GroupHandle::solo(2);
        a.join_local(1, b.own_inbox());
        a.join_local(2, c.own_inbox());
        b.join_local(0, a.own_inbox());
        b.join_local(2, c.own_inbox());
        c.join_local(0, a.own_inbox());
        c.join_local(1, b.own_inbox());

        let ha = a.clone();
        let hb = b.clone();
        let hc = c.clone();
        let (_, _, _) = tokio::join!(
            async move { ha.barrier().await },
            async move { hb.barrier().await },
            async move { hc.barrier().await },
        );
    }

    #[tokio::test]
    async fn remove_rank_excludes_it_from_broadcasts() {
        let (a, b) = wire_pair(0, 1);
        let c = GroupHandle::solo(2);
        a.join_local(2, c.own_inbox());

        a.remove_rank(1);
        assert_eq!(a.peer_ranks(), vec![2]);
        a.broadcast(Message::new(OpCode::Shutdown, vec![]).unwrap()).unwrap();
        assert!(b.try_recv(COMM_ANY_SOURCE, OpCode::Any).is_none());
        assert!(c.try_recv(COMM_ANY_SOURCE, OpCode::Any).is_some());
    }
}
