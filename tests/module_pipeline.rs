//! A source module and a sink module wired together end to end through real
//! `DataConsumer`/`DataProducer` links, driven by `ModuleInstance::run`
//! until both sides shut down cleanly.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use watershed::descriptor::Policy;
use watershed::message::{Message, OpCode};
use watershed::module::{DataConsumer, DataProducer, ModuleContext, ModuleInstance, ProcessingModule};
use watershed::transport::GroupHandle;

struct CountingSourceModule {
    remaining: usize,
}

#[async_trait]
impl ProcessingModule for CountingSourceModule {
    async fn process(&mut self, _message: &Message, ctx: &mut ModuleContext<'_>) -> watershed::Result<()> {
        if self.remaining > 0 {
            self.remaining -= 1;
            let n = self.remaining as u8;
            ctx.send(vec![n]).await?;
        }
        Ok(())
    }
}

struct RecordingModule {
    received: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl ProcessingModule for RecordingModule {
    async fn process(&mut self, message: &Message, _ctx: &mut ModuleContext<'_>) -> watershed::Result<()> {
        self.received.lock().unwrap().push(message.payload.clone());
        Ok(())
    }
}

fn wired_pair(rank_a: i32, rank_b: i32) -> (GroupHandle, GroupHandle) {
    let a = GroupHandle::solo(rank_a);
    let b = GroupHandle::solo(rank_b);
    a.join_local(rank_b, b.own_inbox());
    b.join_local(rank_a, a.own_inbox());
    (a, b)
}

#[tokio::test]
async fn source_emits_are_delivered_to_the_sink_and_both_shut_down_cleanly() {
    let (source_runtime, source_runtime_peer) = wired_pair(0, 100);
    let (sink_runtime, sink_runtime_peer) = wired_pair(1, 101);

    let (data_link_source_side, data_link_sink_side) = wired_pair(0, 1);
    let (_shutdown_tx, shutdown_rx) = watch_pair();

    let mut data_consumer = DataConsumer::new(
        "sink".into(),
        "s".into(),
        0,
        data_link_source_side,
        Policy::Broadcast,
        None,
        shutdown_rx,
    );
    // Normally seeded by the init handshake's credit grant; set directly
    // since that handshake isn't wired into this test.
    data_consumer.set_credit(1, 10);

    let data_producer = DataProducer::new("source".into(), "s".into(), data_link_sink_side);

    let source_siblings = GroupHandle::solo(0);
    let sink_siblings = GroupHandle::solo(1);

    let source_module = Box::new(CountingSourceModule { remaining: 2 });
    let mut source_instance =
        ModuleInstance::new("source".into(), 0, source_siblings, source_runtime, source_module, false);
    source_instance.add_consumer(data_consumer);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink_module = Box::new(RecordingModule {
        received: received.clone(),
    });
    let mut sink_instance = ModuleInstance::new("sink".into(), 1, sink_siblings, sink_runtime, sink_module, true);
    sink_instance.add_producer(data_producer);

    let source_task = tokio::spawn(async move { source_instance.run().await });
    let sink_task = tokio::spawn(async move { sink_instance.run().await });

    // Give both dispatch loops a chance to exchange the two payloads.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(received.lock().unwrap().len(), 2);

    source_runtime_peer
        .send(0, Message::text(OpCode::RemoveInstance, "0").unwrap())
        .unwrap();
    sink_runtime_peer
        .send(1, Message::text(OpCode::RemoveInstance, "1").unwrap())
        .unwrap();

    source_task.await.unwrap().unwrap();
    sink_task.await.unwrap().unwrap();
}

fn watch_pair() -> (tokio::sync::watch::Sender<bool>, tokio::sync::watch::Receiver<bool>) {
    tokio::sync::watch::channel(false)
}
