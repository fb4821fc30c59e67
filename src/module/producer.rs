//! `DataProducer`: the consumer-side link to one upstream module (§3,
//! §4.4.2). Tracks how much credit this instance has already granted each
//! producer instance and replenishes it once exhausted.

use indexmap::IndexMap;

use crate::constants::{COMM_ANY_SOURCE, SHARED_CREDIT};
use crate::error::Result;
use crate::message::{Message, OpCode};
use crate::transport::GroupHandle;

pub struct DataProducer {
    pub module_name: String,
    pub flow_name: String,
    group: GroupHandle,
    credits: IndexMap<i32, i64>,
    initial_credit: i64,
}

impl DataProducer {
    pub fn new(module_name: String, flow_name: String, group: GroupHandle) -> Self {
        let ranks = group.peer_ranks();
        let initial_credit = Self::share_of(ranks.len());
        let credits = ranks.into_iter().map(|r| (r, initial_credit)).collect();
        DataProducer {
            module_name,
            flow_name,
            group,
            credits,
            initial_credit,
        }
    }

    /// Each producer instance's fair share of `SHARED_CREDIT`. Zero producer
    /// instances means there is nobody to grant credit to, so the share is
    /// honestly zero rather than floored to one.
    fn share_of(instance_count: usize) -> i64 {
        if instance_count == 0 {
            0
        } else {
            SHARED_CREDIT / instance_count as i64
        }
    }

    /// The credit grant a newly joined producer instance should be told
    /// about at handshake time (§4.4.1).
    pub fn initial_credit(&self) -> i64 {
        self.initial_credit
    }

    /// Tells every producer instance currently in the group how much credit
    /// it has been granted. Called once right after the link is formed,
    /// since a fresh `DataConsumer` on the producer's side starts every
    /// instance's credit at zero until this arrives.
    pub fn announce_initial_credit(&self) -> Result<()> {
        let announcement = Message::new(OpCode::CreditAnnouncement, self.initial_credit.to_string().into_bytes())?
            .with_source(self.group.self_rank());
        self.group.broadcast(announcement)
    }

    pub fn remaining(&self, rank: i32) -> i64 {
        *self.credits.get(&rank).unwrap_or(&self.initial_credit)
    }

    /// §4.3.3/§4.4.3 `REMOVE_PEER_INSTANCE`: drop `rank`, then recompute and
    /// reissue every surviving instance's share, since removing one instance
    /// changes everyone else's `SHARED_CREDIT / instance_count`.
    pub fn remove_instance(&mut self, rank: i32) {
        self.credits.shift_remove(&rank);
        self.group.remove_rank(rank);
        self.reissue_credit();
    }

    fn reissue_credit(&mut self) {
        let ranks = self.group.peer_ranks();
        self.initial_credit = Self::share_of(ranks.len());
        for rank in ranks {
            self.credits.insert(rank, self.initial_credit);
            if let Ok(announcement) = Message::new(OpCode::CreditAnnouncement, self.initial_credit.to_string().into_bytes())
            {
                let announcement = announcement.with_source(self.group.self_rank());
                let _ = self.group.send(rank, announcement);
            }
        }
    }

    pub fn ranks(&self) -> Vec<i32> {
        self.group.peer_ranks()
    }

    pub fn try_recv_any(&self) -> Option<(i32, Message)> {
        self.group.try_recv(COMM_ANY_SOURCE, OpCode::Any)
    }

    pub fn dispatch_raw_broadcast(&self, message: Message) -> Result<()> {
        self.group.broadcast(message)
    }

    /// Non-blocking: returns `None` if no `MODULE_DATA` is pending from any
    /// producer instance.
    pub fn try_recv(&mut self) -> Option<Result<(i32, Message)>> {
        let (from, message) = self.group.try_recv(COMM_ANY_SOURCE, OpCode::ModuleData)?;
        Some(self.account(from, message))
    }

    pub async fn recv(&mut self) -> Result<(i32, Message)> {
        let (from, message) = self.group.recv(COMM_ANY_SOURCE, OpCode::ModuleData).await;
        self.account(from, message)
    }

    fn account(&mut self, from: i32, message: Message) -> Result<(i32, Message)> {
        let remaining = self.credits.entry(from).or_insert(self.initial_credit);
        *remaining -= 1;
        if *remaining <= 0 {
            let grant = self.initial_credit;
            *self.credits.get_mut(&from).unwrap() = grant;
            let announcement = Message::new(OpCode::CreditAnnouncement, grant.to_string().into_bytes())?
                .with_source(self.group.self_rank());
            self.group.send(from, announcement)?;
        }
        Ok((from, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wired(self_rank: i32, producer_ranks: &[i32]) -> (GroupHandle, Vec<GroupHandle>) {
        let consumer = GroupHandle::solo(self_rank);
        let mut producers = Vec::new();
        for &rank in producer_ranks {
            let producer = GroupHandle::solo(rank);
            consumer.join_local(rank, producer.own_inbox());
            producer.join_local(self_rank, consumer.own_inbox());
            producers.push(producer);
        }
        (consumer, producers)
    }

    #[tokio::test]
    async fn decrements_credit_on_each_receipt() {
        let (consumer, producers) = wired(0, &[1]);
        let mut data_producer = DataProducer::new("src".into(), "s".into(), consumer);
        let initial = data_producer.initial_credit();
        producers[0]
            .send(0, Message::new(OpCode::ModuleData, b"a".to_vec()).unwrap())
            .unwrap();
        data_producer.recv().await.unwrap();
        assert_eq!(data_producer.remaining(1), initial - 1);
    }

    #[tokio::test]
    async fn replenishes_with_an_announcement_once_exhausted() {
        let (consumer, producers) = wired(0, &[1, 2]);
        let mut data_producer = DataProducer::new("src".into(), "s".into(), consumer);
        let initial = data_producer.initial_credit();
        for _ in 0..initial {
            producers[0]
                .send(0, Message::new(OpCode::ModuleData, b"a".to_vec()).unwrap())
                .unwrap();
            data_producer.recv().await.unwrap();
        }
        assert_eq!(data_producer.remaining(1), initial);
        let (_, announcement) = producers[0].recv(COMM_ANY_SOURCE, OpCode::CreditAnnouncement).await;
        let granted: i64 = announcement.payload_as_str().parse().unwrap();
        assert_eq!(granted, initial);
    }

    #[tokio::test]
    async fn try_recv_is_none_when_nothing_pending() {
        let (consumer, _producers) = wired(0, &[1]);
        let mut data_producer = DataProducer::new("src".into(), "s".into(), consumer);
        assert!(data_producer.try_recv().is_none());
    }
}
