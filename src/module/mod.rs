//! A processing-module instance: initialization (§4.4.1), the control-plane
//! dispatch loop (§4.4.3), and drain-and-disconnect (§4.4.4).

pub mod consumer;
pub mod label;
pub mod processing;
pub mod producer;

use std::collections::{HashMap, HashSet};

use tokio::sync::watch;

use crate::constants::{ADMISSION_READY_TIMEOUT, COMM_ANY_SOURCE, COMM_ROOT_PROCESS, POLICY_BROADCAST, POLICY_LABELED, POLICY_ROUND_ROBIN, SLEEP_TIME};
use crate::descriptor::{self, ModuleDescriptor, Policy};
use crate::error::{Result, WatershedError};
use crate::message::{Message, OpCode};
use crate::transport::tcp::{self, Port};
use crate::transport::GroupHandle;

pub use consumer::DataConsumer;
pub use label::{ClosureLabelFunction, LabelFunction, LabelFunctionFactory};
pub use processing::{ModuleContext, ProcessingModule, ProcessingModuleFactory};
pub use producer::DataProducer;

fn policy_to_str(policy: &Policy) -> &'static str {
    match policy {
        Policy::Broadcast => POLICY_BROADCAST,
        Policy::RoundRobin => POLICY_ROUND_ROBIN,
        Policy::Labeled => POLICY_LABELED,
    }
}

fn policy_from_str(s: &str) -> Policy {
    match s {
        POLICY_ROUND_ROBIN => Policy::RoundRobin,
        POLICY_LABELED => Policy::Labeled,
        _ => Policy::Broadcast,
    }
}

/// The running instance of one processing module: its sibling group, its
/// link to the owning runtime, and its producer/consumer links to peer
/// modules, driven by the priority dispatch loop of §4.4.3.
pub struct ModuleInstance {
    name: String,
    rank: i32,
    siblings: GroupHandle,
    runtime: GroupHandle,
    user_module: Box<dyn ProcessingModule>,
    consumers: HashMap<String, DataConsumer>,
    producers: HashMap<String, DataProducer>,
    sequence_number: i32,
    has_declared_inputs: bool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ModuleInstance {
    pub fn new(
        name: String,
        rank: i32,
        siblings: GroupHandle,
        runtime: GroupHandle,
        user_module: Box<dyn ProcessingModule>,
        has_declared_inputs: bool,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        ModuleInstance {
            name,
            rank,
            siblings,
            runtime,
            user_module,
            consumers: HashMap::new(),
            producers: HashMap::new(),
            sequence_number: 0,
            has_declared_inputs,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// §4.4.1: the complete handshake a spawned module instance runs before
    /// joining the dispatch loop. `runtime` must already be connected (the
    /// bare `INIT_PROCESSING_MODULE` dial-back happens before this is
    /// called); this method consumes the `InitModule` frame, connects to
    /// the catalog, opens this instance's own listening port if it has a
    /// declared output, and discovers/connects every producer this
    /// instance's inputs name.
    ///
    /// Each instance acts as the root of its own one-member sibling group:
    /// multi-instance sibling rendezvous (distinct OS processes of the same
    /// module discovering each other) is not implemented, so `siblings` is
    /// always `GroupHandle::solo(rank)`. The barrier calls below are
    /// consequently no-ops today, but are kept at the collective points the
    /// original handshake synchronizes on so a future sibling-rendezvous
    /// implementation only has to populate `siblings`, not restructure this
    /// method.
    pub async fn initialize(rank: i32, runtime: GroupHandle, user_module: Box<dyn ProcessingModule>) -> Result<Self> {
        let (_, init) = runtime.recv(COMM_ROOT_PROCESS, OpCode::InitModule).await;
        let init_payload = init.payload_as_str();
        let mut parts = init_payload.splitn(3, '\t').map(str::to_string);
        let descriptor_path = parts.next().unwrap_or_default();
        let catalog_addr = parts.next().unwrap_or_default();
        let catalog_rank: i32 = parts.next().and_then(|s| s.trim().parse().ok()).unwrap_or(0);

        let descriptor = descriptor::load(std::path::Path::new(&descriptor_path))
            .map_err(|e| WatershedError::DescriptorParse(format!("{descriptor_path}: {e}")))?;

        let siblings = GroupHandle::solo(rank);
        siblings.barrier().await;

        let catalog = GroupHandle::solo(rank);
        tcp::connect(&catalog, catalog_rank, &catalog_addr).await?;

        let has_declared_inputs = !descriptor.inputs.is_empty();
        let mut instance = ModuleInstance::new(
            descriptor.name.clone(),
            rank,
            siblings,
            runtime,
            user_module,
            has_declared_inputs,
        );

        instance.open_output_and_connect_consumers(&descriptor, &catalog).await?;
        instance.connect_producers(&descriptor, &catalog).await?;

        instance.siblings.barrier().await;
        Ok(instance)
    }

    /// If this module declares an output, opens its listening port, reports
    /// it to the owning runtime (satisfying the runtime's ready-gating),
    /// and spawns the accept loop that wires in downstream consumer
    /// instances as they dial back, constructing one [`DataConsumer`] per
    /// distinct consumer module on first contact. Instances of a consumer
    /// module that connect after the initial handshake window still attach
    /// to the transport, but no `DataConsumer` is waiting to see their
    /// `ConsumerPresentation`, so late joiners are a known limitation.
    async fn open_output_and_connect_consumers(&mut self, descriptor: &ModuleDescriptor, catalog: &GroupHandle) -> Result<()> {
        let Some(output) = &descriptor.output else {
            self.runtime.send(COMM_ROOT_PROCESS, Message::text(OpCode::PortName, "")?)?;
            return Ok(());
        };

        let port = Port::open("127.0.0.1:0").await?;
        let advertised = port.advertised().to_string();
        self.runtime.send(COMM_ROOT_PROCESS, Message::text(OpCode::PortName, &advertised)?)?;

        let consumer_group = GroupHandle::solo(self.rank);
        let accept_group = consumer_group.clone();
        let module_name = self.name.clone();
        let base_rank = self.rank;
        tokio::spawn(async move {
            let mut next_rank = base_rank + 1_000_000;
            loop {
                match port.accept_one(&accept_group, next_rank).await {
                    Ok(()) => next_rank += 1,
                    Err(e) => {
                        tracing::warn!(module = %module_name, "output port stopped accepting: {e}");
                        return;
                    }
                }
            }
        });

        catalog.send(COMM_ROOT_PROCESS, Message::text(OpCode::QueryConsumers, &self.name)?)?;
        let (_, reply) = catalog.recv(COMM_ROOT_PROCESS, OpCode::QueryConsumers).await;
        let expected: Vec<String> = reply.payload_as_str().split_whitespace().map(str::to_string).collect();

        let flow_name = output.flow_name.clone();
        let mut seen = HashSet::new();
        let deadline = tokio::time::Instant::now() + ADMISSION_READY_TIMEOUT;
        while seen.len() < expected.len() && tokio::time::Instant::now() < deadline {
            if let Some((from, presentation)) = consumer_group.try_recv(COMM_ANY_SOURCE, OpCode::ConsumerPresentation) {
                let text = presentation.payload_as_str().to_string();
                let mut fields = text.splitn(3, '\t');
                let consumer_name = fields.next().unwrap_or_default().to_string();
                let consumer_flow = fields.next().unwrap_or(&flow_name).to_string();
                let policy = policy_from_str(fields.next().unwrap_or(POLICY_BROADCAST));
                if !self.consumers.contains_key(&consumer_name) {
                    let label_fn = self.user_module.label_function(&consumer_flow);
                    self.add_consumer(DataConsumer::new(
                        consumer_name.clone(),
                        consumer_flow,
                        self.rank,
                        consumer_group.clone(),
                        policy,
                        label_fn,
                        self.shutdown_rx.clone(),
                    ));
                }
                let _ = consumer_group.send(from, Message::text(OpCode::ProducerPresentation, &self.name)?);
                seen.insert(consumer_name);
            } else {
                tokio::time::sleep(SLEEP_TIME).await;
            }
        }
        Ok(())
    }

    /// Discovers and connects a [`DataProducer`] for every declared input
    /// flow: catalog lookup narrowed to that flow, ports discovery against
    /// the producer's owning runtime, connect, presentation, then announce
    /// this instance's share of the producer's credit.
    async fn connect_producers(&mut self, descriptor: &ModuleDescriptor, catalog: &GroupHandle) -> Result<()> {
        for input in &descriptor.inputs {
            let query = format!("{}\t{}", self.name, input.name);
            catalog.send(COMM_ROOT_PROCESS, Message::text(OpCode::QueryProducers, &query)?)?;
            let (_, reply) = catalog.recv(COMM_ROOT_PROCESS, OpCode::QueryProducers).await;
            let producer_names: Vec<String> = reply.payload_as_str().split_whitespace().map(str::to_string).collect();

            for producer_name in producer_names {
                self.runtime
                    .send(COMM_ROOT_PROCESS, Message::text(OpCode::ModulePortsQuery, &producer_name)?)?;
                let (_, ack) = self.runtime.recv(COMM_ROOT_PROCESS, OpCode::RuntimeModulePortsAck).await;
                let ports: Vec<String> = ack.payload_as_str().split_whitespace().map(str::to_string).collect();
                if ports.is_empty() {
                    tracing::warn!(producer = %producer_name, "runtime reported no ports for producer");
                    continue;
                }

                let producer_group = GroupHandle::solo(self.rank);
                for (i, port) in ports.iter().enumerate() {
                    tcp::connect(&producer_group, i as i32, port).await?;
                }
                let presentation = format!("{}\t{}\t{}", self.name, input.name, policy_to_str(&input.policy));
                producer_group.broadcast(Message::text(OpCode::ConsumerPresentation, &presentation)?)?;
                for rank in producer_group.peer_ranks() {
                    let _ = producer_group.recv(rank, OpCode::ProducerPresentation).await;
                }

                let data_producer = DataProducer::new(producer_name.clone(), input.name.clone(), producer_group);
                data_producer.announce_initial_credit()?;
                self.add_producer(data_producer);
            }
        }
        Ok(())
    }

    pub fn add_consumer(&mut self, consumer: DataConsumer) {
        self.consumers.insert(consumer.module_name.clone(), consumer);
    }

    pub fn add_producer(&mut self, producer: DataProducer) {
        self.producers.insert(producer.module_name.clone(), producer);
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// The priority scan of §4.4.3, one iteration. Returns `true` if any
    /// work was dispatched (used by the caller to decide whether to sleep).
    async fn dispatch_once(&mut self) -> Result<bool> {
        if let Some((_, message)) = self.runtime.try_recv(COMM_ANY_SOURCE, OpCode::Any) {
            self.handle_runtime_message(message).await?;
            return Ok(true);
        }

        for consumer in self.consumers.values_mut() {
            consumer.drain_pending_announcements();
        }

        let producer_names: Vec<String> = self.producers.keys().cloned().collect();
        for name in producer_names {
            let received = self.producers.get_mut(&name).and_then(|p| p.try_recv());
            if let Some(result) = received {
                let (_, message) = result?;
                self.deliver_to_user(&message).await?;
                return Ok(true);
            }
        }

        if !self.has_declared_inputs {
            let empty = Message::new(OpCode::ModuleData, Vec::new())?.with_source(self.rank);
            self.deliver_to_user(&empty).await?;
            return Ok(true);
        }

        Ok(false)
    }

    async fn deliver_to_user(&mut self, message: &Message) -> Result<()> {
        // Exactly one declared output in this design, so a single consumer
        // link (if any) backs the context's `send`.
        let consumer_name = self.consumers.keys().next().cloned();
        let mut consumer_ref = consumer_name.and_then(|n| self.consumers.get_mut(&n));
        let mut ctx = ModuleContext::new(consumer_ref.as_deref_mut(), &mut self.sequence_number);
        self.user_module.process(message, &mut ctx).await
    }

    async fn handle_runtime_message(&mut self, message: Message) -> Result<()> {
        match message.op_code {
            OpCode::Disconnect => {
                let target = message.payload_as_str().to_string();
                self.drain_and_disconnect(&target).await?;
            }
            OpCode::RemoveInstance => {
                let rank: i32 = message.payload_as_str().trim().parse().unwrap_or(-1);
                for consumer in self.consumers.values_mut() {
                    consumer.remove_instance(rank);
                }
                for producer in self.producers.values_mut() {
                    producer.remove_instance(rank);
                }
                self.siblings.remove_rank(rank);
                if rank == self.rank {
                    let _ = self.shutdown_tx.send(true);
                }
            }
            OpCode::RemovePeerInstance => {
                let message_payload = message.payload_as_str();
                let mut parts = message_payload.splitn(2, '\t').map(str::to_string);
                let name = parts.next().unwrap_or_default();
                let rank: i32 = parts.next().and_then(|r| r.parse().ok()).unwrap_or(-1);
                if let Some(consumer) = self.consumers.get_mut(&name) {
                    consumer.remove_instance(rank);
                }
                if let Some(producer) = self.producers.get_mut(&name) {
                    producer.remove_instance(rank);
                }
            }
            OpCode::Shutdown => {
                self.siblings.barrier().await;
                let _ = self.shutdown_tx.send(true);
            }
            _ => {}
        }
        Ok(())
    }

    /// §4.4.4: send `TERMINATION` into the named peer group, drain any
    /// interleaved data/credit traffic while counting acks from every
    /// instance, barrier, then disconnect.
    async fn drain_and_disconnect(&mut self, target: &str) -> Result<()> {
        if let Some(mut consumer) = self.consumers.remove(target) {
            drain_consumer_termination(&mut consumer).await;
        }
        if let Some(mut producer) = self.producers.remove(target) {
            drain_producer_termination(&mut producer).await;
        }
        Ok(())
    }

    /// Runs the dispatch loop until the shutdown flag is set, then performs
    /// the exit sequence: drain every remaining consumer/producer link, the
    /// sibling group, and finally the runtime link.
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(name = %self.name, rank = self.rank, "module instance dispatch loop starting");
        loop {
            if self.is_shutting_down() {
                break;
            }
            let dispatched = self.dispatch_once().await?;
            if !dispatched {
                tokio::time::sleep(SLEEP_TIME).await;
            }
        }

        let consumer_targets: Vec<String> = self.consumers.keys().cloned().collect();
        for target in consumer_targets {
            self.drain_and_disconnect(&target).await?;
        }
        let producer_targets: Vec<String> = self.producers.keys().cloned().collect();
        for target in producer_targets {
            if let Some(mut producer) = self.producers.remove(&target) {
                drain_producer_termination(&mut producer).await;
            }
        }
        self.siblings.disconnect().await;
        tracing::info!(name = %self.name, "module instance shut down");
        Ok(())
    }
}

/// The entry point a module binary's `main` calls once it knows its own
/// rank and the address of the runtime that spawned it: dials back into the
/// runtime, completes the §4.4.1 handshake, then runs the dispatch loop
/// until shutdown. A module binary statically links one `ProcessingModule`
/// implementation and passes it here rather than `dlopen`ing a shared
/// object, per the no-dynamic-loading constraint this crate's modules
/// operate under.
pub async fn run_module_main(rank: i32, runtime_addr: &str, user_module: Box<dyn ProcessingModule>) -> Result<()> {
    let runtime = GroupHandle::solo(rank);
    tcp::connect(&runtime, COMM_ROOT_PROCESS, runtime_addr).await?;
    let mut instance = ModuleInstance::initialize(rank, runtime, user_module).await?;
    instance.run().await
}

/// §4.4.4 for one `DataConsumer` link: broadcast `TERMINATION`, then drain
/// interleaved credit traffic until every peer instance has acked.
async fn drain_consumer_termination(consumer: &mut DataConsumer) {
    let expected = consumer.ranks().len();
    let termination = Message::new(OpCode::Termination, Vec::new()).expect("termination frame");
    let _ = consumer.dispatch_raw_broadcast(termination);
    let mut seen = std::collections::HashSet::new();
    while seen.len() < expected {
        consumer.drain_pending_announcements();
        if let Some((from, message)) = consumer.try_recv_any() {
            if message.op_code == OpCode::Termination {
                seen.insert(from);
            }
        } else {
            tokio::time::sleep(SLEEP_TIME).await;
        }
    }
}

/// Symmetric form for a `DataProducer` link.
async fn drain_producer_termination(producer: &mut DataProducer) {
    let expected = producer.ranks().len();
    let termination = Message::new(OpCode::Termination, Vec::new()).expect("termination frame");
    let _ = producer.dispatch_raw_broadcast(termination);
    let mut seen = std::collections::HashSet::new();
    while seen.len() < expected {
        if let Some((from, message)) = producer.try_recv_any() {
            if message.op_code == OpCode::Termination {
                seen.insert(from);
            }
        } else {
            tokio::time::sleep(SLEEP_TIME).await;
        }
    }
}
