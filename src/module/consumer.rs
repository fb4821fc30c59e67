//! `DataConsumer`: the producer-side link to one downstream module (§3,
//! §4.4.2). Owns the distribution policy, the per-instance credit table
//! (ordered by consumer rank), and the round-robin cursor.

use indexmap::IndexMap;
use tokio::sync::watch;

use crate::descriptor::Policy;
use crate::error::{Result, WatershedError};
use crate::message::{Message, OpCode};
use crate::module::label::LabelFunction;
use crate::transport::GroupHandle;

pub struct DataConsumer {
    pub module_name: String,
    pub flow_name: String,
    own_rank: i32,
    group: GroupHandle,
    policy: Policy,
    label_fn: Option<Box<dyn LabelFunction>>,
    credits: IndexMap<i32, i64>,
    next_to_receive: usize,
    shutdown: watch::Receiver<bool>,
}

impl DataConsumer {
    pub fn new(
        module_name: String,
        flow_name: String,
        own_rank: i32,
        group: GroupHandle,
        policy: Policy,
        label_fn: Option<Box<dyn LabelFunction>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let credits = group.peer_ranks().into_iter().map(|r| (r, 0i64)).collect();
        DataConsumer {
            module_name,
            flow_name,
            own_rank,
            group,
            policy,
            label_fn,
            credits,
            next_to_receive: 0,
            shutdown,
        }
    }

    pub fn credit(&self, rank: i32) -> i64 {
        *self.credits.get(&rank).unwrap_or(&0)
    }

    pub fn set_credit(&mut self, rank: i32, value: i64) {
        self.credits.insert(rank, value);
    }

    pub fn instance_count(&self) -> usize {
        self.credits.len()
    }

    pub fn ranks(&self) -> Vec<i32> {
        self.credits.keys().copied().collect()
    }

    /// §4.3.3: re-form this peer group excluding `rank`.
    pub fn remove_instance(&mut self, rank: i32) {
        self.credits.shift_remove(&rank);
        self.group.remove_rank(rank);
        if self.credits.is_empty() {
            self.next_to_receive = 0;
        } else {
            self.next_to_receive %= self.credits.len();
        }
    }

    /// Drains any `CREDIT_ANNOUNCEMENT`s already sitting in the inbox
    /// without blocking, applying each to the issuing rank's credit.
    pub fn drain_pending_announcements(&mut self) {
        while let Some((from, message)) = self.group.try_recv(crate::constants::COMM_ANY_SOURCE, OpCode::CreditAnnouncement) {
            let _ = self.apply_announcement(from, &message);
        }
    }

    /// Non-blocking probe of this link for any pending message, used by the
    /// drain-and-disconnect protocol (§4.4.4) to count `TERMINATION` acks
    /// while still dispatching interleaved traffic.
    pub fn try_recv_any(&self) -> Option<(i32, Message)> {
        self.group.try_recv(crate::constants::COMM_ANY_SOURCE, OpCode::Any)
    }

    /// Broadcasts a pre-built control frame (e.g. `TERMINATION`) to every
    /// current peer instance, bypassing credit accounting.
    pub fn dispatch_raw_broadcast(&self, message: Message) -> Result<()> {
        self.group.broadcast(message)
    }

    fn apply_announcement(&mut self, from: i32, message: &Message) -> Result<()> {
        let value: i64 = message
            .payload_as_str()
            .trim()
            .parse()
            .map_err(|_| WatershedError::BadParameter("malformed credit announcement".into()))?;
        self.credits.insert(from, value);
        Ok(())
    }

    async fn wait_for_announcement(&mut self, rank: i32) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Err(WatershedError::Transport("shutdown while awaiting credit".into()));
                    }
                }
                (from, message) = self.group.recv(rank, OpCode::CreditAnnouncement) => {
                    self.apply_announcement(from, &message)?;
                    return Ok(());
                }
            }
        }
    }

    async fn wait_for_any_announcement(&mut self) -> Result<i32> {
        loop {
            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Err(WatershedError::Transport("shutdown while awaiting credit".into()));
                    }
                }
                (from, message) = self.group.recv(crate::constants::COMM_ANY_SOURCE, OpCode::CreditAnnouncement) => {
                    self.apply_announcement(from, &message)?;
                    return Ok(from);
                }
            }
        }
    }

    fn build_message(&self, payload: Vec<u8>, seq: i32) -> Result<Message> {
        Message::new(OpCode::ModuleData, payload)?
            .with_source(self.own_rank)
            .with_sequence_number(seq)
            .with_source_stream(&self.flow_name)
    }

    pub async fn dispatch(&mut self, payload: Vec<u8>, seq: i32) -> Result<()> {
        match self.policy {
            Policy::Broadcast => self.dispatch_broadcast(payload, seq).await,
            Policy::RoundRobin => self.dispatch_round_robin(payload, seq).await,
            Policy::Labeled => self.dispatch_labeled(payload, seq).await,
        }
    }

    async fn dispatch_broadcast(&mut self, payload: Vec<u8>, seq: i32) -> Result<()> {
        let ranks = self.ranks();
        for rank in &ranks {
            while self.credit(*rank) == 0 {
                self.wait_for_announcement(*rank).await?;
            }
        }
        for rank in &ranks {
            *self.credits.get_mut(rank).unwrap() -= 1;
        }
        let message = self.build_message(payload, seq)?;
        self.group.broadcast(message)
    }

    async fn dispatch_round_robin(&mut self, payload: Vec<u8>, seq: i32) -> Result<()> {
        loop {
            let ranks = self.ranks();
            if ranks.is_empty() {
                return Err(WatershedError::BadParameter(format!(
                    "no instances left on consumer {}",
                    self.module_name
                )));
            }
            let n = ranks.len();
            let start = self.next_to_receive % n;
            if let Some(offset) = (0..n).find(|i| self.credit(ranks[(start + i) % n]) > 0) {
                let chosen = ranks[(start + offset) % n];
                *self.credits.get_mut(&chosen).unwrap() -= 1;
                self.next_to_receive = (start + offset + 1) % n;
                let message = self.build_message(payload, seq)?;
                self.group.send(chosen, message)?;
                self.drain_pending_announcements();
                return Ok(());
            }
            self.wait_for_any_announcement().await?;
        }
    }

    async fn dispatch_labeled(&mut self, payload: Vec<u8>, seq: i32) -> Result<()> {
        let ranks = self.ranks();
        if ranks.is_empty() {
            return Err(WatershedError::BadParameter(format!(
                "no instances left on consumer {}",
                self.module_name
            )));
        }
        let label_fn = self
            .label_fn
            .as_ref()
            .ok_or_else(|| WatershedError::BadParameter("labeled policy without a label function".into()))?;
        let probe = self.build_message(payload.clone(), seq)?;
        let index = label_fn.label(&probe, ranks.len()) % ranks.len();
        let chosen = ranks[index];
        while self.credit(chosen) == 0 {
            self.wait_for_announcement(chosen).await?;
        }
        *self.credits.get_mut(&chosen).unwrap() -= 1;
        let message = self.build_message(payload, seq)?;
        self.group.send(chosen, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::label::ClosureLabelFunction;

    fn sender(self_rank: i32, peer_ranks: &[i32]) -> (GroupHandle, Vec<GroupHandle>, watch::Sender<bool>) {
        let producer = GroupHandle::solo(self_rank);
        let mut peers = Vec::new();
        for &rank in peer_ranks {
            let peer = GroupHandle::solo(rank);
            producer.join_local(rank, peer.own_inbox());
            peer.join_local(self_rank, producer.own_inbox());
            peers.push(peer);
        }
        let (tx, _rx) = watch::channel(false);
        (producer, peers, tx)
    }

    fn credit_announcement(value: i64) -> Message {
        Message::new(OpCode::CreditAnnouncement, value.to_string().into_bytes()).unwrap()
    }

    #[tokio::test]
    async fn broadcast_delivers_to_every_instance_once_credited() {
        let (producer, peers, tx) = sender(0, &[1, 2, 3]);
        let mut consumer = DataConsumer::new(
            "snk".into(),
            "s".into(),
            0,
            producer,
            Policy::Broadcast,
            None,
            tx.subscribe(),
        );
        for rank in [1, 2, 3] {
            consumer.set_credit(rank, 5);
        }
        consumer.dispatch(b"X".to_vec(), 0).await.unwrap();
        for peer in &peers {
            let (_, msg) = peer.recv(crate::constants::COMM_ANY_SOURCE, OpCode::Any).await;
            assert_eq!(msg.payload, b"X");
        }
        for rank in [1, 2, 3] {
            assert_eq!(consumer.credit(rank), 4);
        }
    }

    #[tokio::test]
    async fn round_robin_cycles_through_instances() {
        let (producer, peers, tx) = sender(0, &[1, 2]);
        let mut consumer = DataConsumer::new(
            "snk".into(),
            "s".into(),
            0,
            producer,
            Policy::RoundRobin,
            None,
            tx.subscribe(),
        );
        for rank in [1, 2] {
            consumer.set_credit(rank, 10);
        }
        for i in 0..4 {
            consumer.dispatch(vec![i], i as i32).await.unwrap();
        }
        let (_, m0) = peers[0].recv(crate::constants::COMM_ANY_SOURCE, OpCode::Any).await;
        let (_, m1) = peers[0].recv(crate::constants::COMM_ANY_SOURCE, OpCode::Any).await;
        assert_eq!((m0.payload[0], m1.payload[0]), (0, 2));
        let (_, m2) = peers[1].recv(crate::constants::COMM_ANY_SOURCE, OpCode::Any).await;
        let (_, m3) = peers[1].recv(crate::constants::COMM_ANY_SOURCE, OpCode::Any).await;
        assert_eq!((m2.payload[0], m3.payload[0]), (1, 3));
    }

    #[tokio::test]
    async fn round_robin_blocks_until_credit_announcement_arrives() {
        let (producer, peers, tx) = sender(0, &[1, 2]);
        let mut consumer = DataConsumer::new(
            "snk".into(),
            "s".into(),
            0,
            producer,
            Policy::RoundRobin,
            None,
            tx.subscribe(),
        );
        consumer.set_credit(1, 0);
        consumer.set_credit(2, 0);

        let dispatch = tokio::spawn(async move {
            consumer.dispatch(b"Z".to_vec(), 0).await.unwrap();
            consumer
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        peers[0].send(0, credit_announcement(1)).unwrap();
        let consumer = dispatch.await.unwrap();
        assert_eq!(consumer.credit(1), 0);
    }

    #[tokio::test]
    async fn labeled_policy_routes_equal_keys_to_the_same_instance() {
        let (producer, _peers, tx) = sender(0, &[1, 2]);
        let label_fn: Box<dyn LabelFunction> = Box::new(ClosureLabelFunction(|m: &Message, n: usize| {
            (m.payload[0] as usize) % n
        }));
        let mut consumer = DataConsumer::new(
            "snk".into(),
            "s".into(),
            0,
            producer,
            Policy::Labeled,
            Some(label_fn),
            tx.subscribe(),
        );
        consumer.set_credit(1, 10);
        consumer.set_credit(2, 10);
        let ranks = consumer.ranks();
        let a1 = ranks[(b'a' as usize) % ranks.len()];
        consumer.dispatch(vec![b'a'], 0).await.unwrap();
        consumer.dispatch(vec![b'a'], 1).await.unwrap();
        let a2 = ranks[(b'a' as usize) % ranks.len()];
        assert_eq!(a1, a2);
    }
}
