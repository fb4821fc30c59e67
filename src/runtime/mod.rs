//! The runtime daemon (§4.3): admits and supervises module instances on one
//! host, coordinates cluster-wide operations with its peer runtimes, and
//! serves the console.

pub mod files;

use std::collections::{HashMap, HashSet};

use crate::constants::{ADMISSION_ACCEPT_TIMEOUT, ADMISSION_READY_TIMEOUT, COMM_ANY_SOURCE, PEER_QUERY_TIMEOUT, SLEEP_TIME};
use crate::descriptor::{self, ClusterConfig, ModuleDescriptor};
use crate::error::{Result, WatershedError};
use crate::message::{Message, OpCode};
use crate::scheduler::Scheduler;
use crate::transport::tcp::{self, Port};
use crate::transport::GroupHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Idle,
    Running,
    Draining,
    Exit,
}

/// An admitted module, as tracked by the runtime that owns it (§3).
pub struct ActiveModule {
    pub descriptor: ModuleDescriptor,
    pub group: GroupHandle,
    pub termination_acks: usize,
    /// One advertised port string per instance, reported by the instance
    /// itself via `PORT_NAME` during admission (empty string for an
    /// instance with no declared output).
    pub ports: Vec<String>,
}

pub struct RuntimeDaemon {
    pub rank: i32,
    is_root: bool,
    state: RuntimeState,
    cluster: ClusterConfig,
    peer_runtimes: GroupHandle,
    catalog: GroupHandle,
    catalog_addr: String,
    scheduler: Scheduler,
    console_addr: String,
    console: GroupHandle,
    module_port: Port,
    module_addr: String,
    active_modules: HashMap<String, ActiveModule>,
    next_module_rank: i32,
}

impl RuntimeDaemon {
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        rank: i32,
        is_root: bool,
        cluster: ClusterConfig,
        peer_runtimes: GroupHandle,
        catalog: GroupHandle,
        catalog_addr: String,
        console_bind_addr: &str,
        module_bind_addr: &str,
    ) -> Result<Self> {
        let console_port = Port::open(console_bind_addr).await?;
        let console_addr = console_port.advertised().to_string();
        let console = GroupHandle::solo(rank);

        if is_root {
            let accept_group = console.clone();
            tokio::spawn(async move {
                let mut next_rank = 1_000_000;
                loop {
                    match console_port.accept_one(&accept_group, next_rank).await {
                        Ok(()) => next_rank += 1,
                        Err(e) => {
                            tracing::warn!("console listener stopped accepting: {e}");
                            return;
                        }
                    }
                }
            });
        }

        let module_port = Port::open(module_bind_addr).await?;
        let module_addr = module_port.advertised().to_string();

        let catalog_group_size = catalog.member_count().max(1) as i32;
        Ok(RuntimeDaemon {
            rank,
            is_root,
            state: RuntimeState::Idle,
            cluster,
            peer_runtimes,
            catalog,
            catalog_addr,
            scheduler: Scheduler::new(catalog_group_size),
            console_addr,
            console,
            module_port,
            module_addr,
            active_modules: HashMap::new(),
            next_module_rank: 100,
        })
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    pub fn console_port(&self) -> &str {
        &self.console_addr
    }

    /// §4.3.1: admission of a new module, initiated by the root on receipt
    /// of `ADD_PROCESSING_MODULE` from the console. `descriptor_path` is
    /// relayed verbatim to every spawned instance in `INIT_PROCESSING_MODULE`
    /// so the instance can load the same descriptor this runtime just did.
    pub async fn admit_module(&mut self, descriptor_path: &str, mut descriptor: ModuleDescriptor) -> Result<()> {
        if self.active_modules.contains_key(&descriptor.name) {
            return Err(WatershedError::ProcessSpawn(format!(
                "module {:?} is already running",
                descriptor.name
            )));
        }
        if self.any_peer_runtime_has_module(&descriptor.name).await? {
            return Err(WatershedError::ProcessSpawn(format!(
                "module {:?} is already running on another runtime",
                descriptor.name
            )));
        }

        let assignment = self.scheduler.choose_hosts(&self.cluster.hosts, &mut descriptor);
        if assignment.is_empty() {
            return Err(WatershedError::ProcessSpawn(format!(
                "no eligible host satisfies demands for module {:?}",
                descriptor.name
            )));
        }
        let catalog_rank = descriptor.assigned_catalog_rank.unwrap_or(0);

        let group = GroupHandle::solo(self.rank);
        let binary = descriptor.library_file.clone();
        let mut instance_count_total = 0usize;
        for (host_name, instance_count) in &assignment {
            let host = self
                .cluster
                .hosts
                .iter()
                .find(|h| &h.name == host_name)
                .ok_or_else(|| WatershedError::ProcessSpawn(format!("unknown host {host_name:?}")))?;
            for _ in 0..*instance_count {
                let remote_rank = self.next_module_rank;
                self.next_module_rank += 1;
                let mut args = descriptor.arguments.clone();
                args.push("--rank".into());
                args.push(remote_rank.to_string());
                args.push("--runtime-addr".into());
                args.push(self.module_addr.clone());
                tcp::spawn_instance(host, &binary, &args).await?;
                tokio::time::timeout(ADMISSION_ACCEPT_TIMEOUT, self.module_port.accept_one(&group, remote_rank))
                    .await
                    .map_err(|_| {
                        WatershedError::ProcessSpawn(format!(
                            "instance {remote_rank} of {:?} never dialed back in",
                            descriptor.name
                        ))
                    })??;
                instance_count_total += 1;
            }
        }

        let init_payload = format!("{descriptor_path}\t{}\t{catalog_rank}", self.catalog_addr);
        group.broadcast(Message::text(OpCode::InitModule, &init_payload)?)?;

        let ports = self.await_instances_ready(&group, instance_count_total, &descriptor.name).await?;

        self.active_modules.insert(
            descriptor.name.clone(),
            ActiveModule {
                descriptor,
                group,
                termination_acks: 0,
                ports,
            },
        );
        Ok(())
    }

    /// Admission step 1: ask every peer runtime whether it already owns a
    /// module by this name, so admission is rejected cluster-wide rather
    /// than just against this runtime's own table.
    async fn any_peer_runtime_has_module(&self, name: &str) -> Result<bool> {
        let peers = self.peer_runtimes.peer_ranks();
        if peers.is_empty() {
            return Ok(false);
        }
        self.peer_runtimes.broadcast(Message::text(OpCode::ModuleRunningQuery, name)?)?;
        let mut pending: HashSet<i32> = peers.into_iter().collect();
        let deadline = tokio::time::Instant::now() + PEER_QUERY_TIMEOUT;
        let mut running = false;
        while !pending.is_empty() && tokio::time::Instant::now() < deadline {
            if let Some((from, message)) = self.peer_runtimes.try_recv(COMM_ANY_SOURCE, OpCode::ModuleRunningAck) {
                pending.remove(&from);
                if message.payload_as_str().trim() == "1" {
                    running = true;
                }
            } else {
                tokio::time::sleep(SLEEP_TIME).await;
            }
        }
        Ok(running)
    }

    /// Admission step 7: gate the `active_modules` insertion on actually
    /// hearing back from every spawned instance, rather than assuming spawn
    /// success means the module is ready. An `ERROR_LOG` from any instance
    /// fails admission immediately with that instance's reported reason.
    async fn await_instances_ready(&self, group: &GroupHandle, expected: usize, module_name: &str) -> Result<Vec<String>> {
        let mut ports = Vec::new();
        let deadline = tokio::time::Instant::now() + ADMISSION_READY_TIMEOUT;
        while ports.len() < expected {
            if tokio::time::Instant::now() >= deadline {
                return Err(WatershedError::ProcessSpawn(format!(
                    "module {module_name:?} only reported {} of {expected} instances ready",
                    ports.len()
                )));
            }
            if let Some((_, message)) = group.try_recv(COMM_ANY_SOURCE, OpCode::PortName) {
                ports.push(message.payload_as_str().to_string());
            } else if let Some((_, message)) = group.try_recv(COMM_ANY_SOURCE, OpCode::ErrorLog) {
                return Err(WatershedError::ProcessSpawn(format!(
                    "module {module_name:?} reported init failure: {}",
                    message.payload_as_str()
                )));
            } else {
                tokio::time::sleep(SLEEP_TIME).await;
            }
        }
        Ok(ports)
    }

    /// Pure local lookup, used when answering a query a peer runtime has
    /// already forwarded to us — no further forwarding, so a cluster-wide
    /// query can never loop back on itself.
    fn local_ports_for(&self, requested_names: &str) -> (Vec<String>, Vec<String>) {
        let mut found = Vec::new();
        let mut unmatched = Vec::new();
        for name in requested_names.split_whitespace() {
            match self.active_modules.get(name) {
                Some(active) => found.extend(active.ports.iter().cloned()),
                None => unmatched.push(name.to_string()),
            }
        }
        (found, unmatched)
    }

    /// §4.3.2: discovery reply. Answers directly for modules this runtime
    /// owns, then forwards any unmatched names to every peer runtime and
    /// aggregates their `RUNTIME_MODULE_PORTS_ACK` replies before answering
    /// the caller.
    pub async fn reply_to_ports_query(&self, requested_names: &str) -> Result<String> {
        let (mut found, unmatched) = self.local_ports_for(requested_names);
        if unmatched.is_empty() {
            return Ok(found.join(" "));
        }

        let peers = self.peer_runtimes.peer_ranks();
        let query = unmatched.join(" ");
        for peer in &peers {
            self.peer_runtimes.send(*peer, Message::text(OpCode::ModulePortsQuery, &query)?)?;
        }
        let mut pending: HashSet<i32> = peers.into_iter().collect();
        let deadline = tokio::time::Instant::now() + PEER_QUERY_TIMEOUT;
        while !pending.is_empty() && tokio::time::Instant::now() < deadline {
            if let Some((from, message)) = self.peer_runtimes.try_recv(COMM_ANY_SOURCE, OpCode::RuntimeModulePortsAck) {
                pending.remove(&from);
                found.extend(message.payload_as_str().split_whitespace().map(str::to_string));
            } else {
                tokio::time::sleep(SLEEP_TIME).await;
            }
        }
        Ok(found.join(" "))
    }

    /// §4.3.3, remove-module path. `target` must equal a key in
    /// `active_modules` on the owning runtime; every other owned module is
    /// told to disconnect from it first.
    pub async fn remove_module(&mut self, target: &str) -> Result<()> {
        for (name, active) in self.active_modules.iter() {
            if name == target {
                continue;
            }
            active.group.broadcast(Message::text(OpCode::Disconnect, target)?)?;
            active.group.barrier().await;
        }

        let Some(active) = self.active_modules.remove(target) else {
            return Err(WatershedError::ProcessRemove(format!(
                "module {target:?} is not owned by this runtime"
            )));
        };
        active.group.broadcast(Message::new(OpCode::Shutdown, Vec::new())?)?;
        active.group.barrier().await;
        self.catalog
            .broadcast(Message::text(OpCode::RemoveModule, target)?)?;
        Ok(())
    }

    /// §4.3.3, remove-instance path.
    pub async fn remove_instance(&mut self, target: &str, instance_rank: i32) -> Result<()> {
        for (name, active) in self.active_modules.iter() {
            if name == target {
                continue;
            }
            let payload = format!("{target}\t{instance_rank}");
            active
                .group
                .broadcast(Message::text(OpCode::RemovePeerInstance, &payload)?)?;
        }
        let Some(active) = self.active_modules.get(target) else {
            return Err(WatershedError::ProcessRemove(format!(
                "module {target:?} is not owned by this runtime"
            )));
        };
        active
            .group
            .broadcast(Message::text(OpCode::RemoveInstance, &instance_rank.to_string())?)?;
        active.group.remove_rank(instance_rank);
        Ok(())
    }

    /// §4.3.3, cluster-wide shutdown. Called directly by the root on receipt
    /// of the console's `SHUTDOWN`, and by every other runtime once it
    /// observes `SHUTDOWN` arrive on `peer_runtimes`.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.state = RuntimeState::Draining;
        if self.is_root {
            self.peer_runtimes.broadcast(Message::new(OpCode::Shutdown, Vec::new())?)?;
        }
        self.peer_runtimes.barrier().await;

        self.catalog.broadcast(Message::new(OpCode::Shutdown, Vec::new())?)?;
        self.catalog.barrier().await;

        let names: Vec<String> = self.active_modules.keys().cloned().collect();
        for name in names {
            if let Some(active) = self.active_modules.remove(&name) {
                active.group.broadcast(Message::new(OpCode::Shutdown, Vec::new())?)?;
                active.group.barrier().await;
            }
        }

        if !self.is_root {
            self.peer_runtimes
                .send(0, Message::new(OpCode::ShutdownAck, Vec::new())?)?;
        }
        self.state = RuntimeState::Exit;
        Ok(())
    }

    /// Handles one request arriving over the console link: admits, removes,
    /// or shuts down as asked, and replies with the matching ack or the
    /// error frame the failure produced (§4.5).
    async fn handle_console_message(&mut self, from: i32, message: Message) {
        let reply = match message.op_code {
            OpCode::AddModule => {
                let path = message.payload_as_str().to_string();
                match descriptor::load(std::path::Path::new(&path)) {
                    Ok(d) => match self.admit_module(&path, d).await {
                        Ok(()) => Message::new(OpCode::AddModuleAck, Vec::new()),
                        Err(e) => Message::text(OpCode::AddModuleError, &e.to_string()),
                    },
                    Err(e) => Message::text(OpCode::AddModuleError, &e.to_string()),
                }
            }
            OpCode::RemoveModule => {
                let name = message.payload_as_str().to_string();
                match self.remove_module(&name).await {
                    Ok(()) => Message::new(OpCode::RemoveModuleAck, Vec::new()),
                    Err(e) => Message::text(OpCode::RemoveModuleError, &e.to_string()),
                }
            }
            OpCode::RemoveInstance => {
                let text = message.payload_as_str().to_string();
                let mut parts = text.splitn(2, '\t');
                let name = parts.next().unwrap_or_default().to_string();
                let instance: i32 = parts.next().and_then(|s| s.trim().parse().ok()).unwrap_or(-1);
                match self.remove_instance(&name, instance).await {
                    Ok(()) => Message::new(OpCode::RemoveInstanceAck, Vec::new()),
                    Err(e) => Message::text(OpCode::RemoveModuleError, &e.to_string()),
                }
            }
            OpCode::Shutdown => match self.shutdown().await {
                Ok(()) => Message::new(OpCode::ShutdownAck, Vec::new()),
                Err(e) => Message::text(OpCode::RemoveModuleError, &e.to_string()),
            },
            other => Message::text(
                OpCode::AddModuleError,
                &format!("unexpected console request {other:?}"),
            ),
        };
        if let Ok(reply) = reply {
            let _ = self.console.send(from, reply);
        }
    }

    /// Handles one message arriving from a peer runtime: cluster shutdown
    /// propagation, a running-module probe (admission step 1), and
    /// `MODULE_PORTS_QUERY` forwarding (§4.3.2). The ports-query reply here
    /// is local-only (`local_ports_for`, not `reply_to_ports_query`) since
    /// this message already *is* a peer's forwarded query — answering it
    /// with another round of forwarding would loop forever.
    async fn handle_peer_runtime_message(&mut self, from: i32, message: Message) {
        match message.op_code {
            OpCode::Shutdown if !self.is_root => {
                let _ = self.shutdown().await;
            }
            OpCode::ModuleRunningQuery => {
                let name = message.payload_as_str().to_string();
                let running = if self.active_modules.contains_key(&name) { "1" } else { "0" };
                if let Ok(ack) = Message::text(OpCode::ModuleRunningAck, running) {
                    let _ = self.peer_runtimes.send(from, ack);
                }
            }
            OpCode::ModulePortsQuery => {
                let requested = message.payload_as_str().to_string();
                let (found, _unmatched) = self.local_ports_for(&requested);
                if let Ok(ack) = Message::text(OpCode::RuntimeModulePortsAck, &found.join(" ")) {
                    let _ = self.peer_runtimes.send(from, ack);
                }
            }
            _ => {}
        }
    }

    /// Handles one message arriving from a module instance this runtime
    /// owns: `MODULE_PORTS_QUERY` is answered with the full forwarding
    /// lookup (local modules, then peer runtimes for the rest).
    async fn handle_module_message(&mut self, owner: &str, from: i32, message: Message) {
        match message.op_code {
            OpCode::ModulePortsQuery => {
                let requested = message.payload_as_str().to_string();
                match self.reply_to_ports_query(&requested).await {
                    Ok(reply) => {
                        if let Some(active) = self.active_modules.get(owner) {
                            if let Ok(ack) = Message::text(OpCode::RuntimeModulePortsAck, &reply) {
                                let _ = active.group.send(from, ack);
                            }
                        }
                    }
                    Err(e) => tracing::warn!(owner, "ports query failed: {e}"),
                }
            }
            other => {
                tracing::debug!(owner, from, op = ?other, "unsolicited message from owned module group");
            }
        }
    }

    /// The server loop's priority scan (§4.3): console requests (root
    /// only), then peer-runtime traffic, then unsolicited traffic from
    /// locally owned module groups.
    pub async fn run_server_loop(&mut self) {
        self.state = RuntimeState::Running;
        while self.state == RuntimeState::Running {
            let mut did_work = false;

            if self.is_root {
                if let Some((from, message)) = self.console.try_recv(COMM_ANY_SOURCE, OpCode::Any) {
                    self.handle_console_message(from, message).await;
                    did_work = true;
                }
            }

            if !did_work {
                if let Some((from, message)) = self.peer_runtimes.try_recv(COMM_ANY_SOURCE, OpCode::Any) {
                    self.handle_peer_runtime_message(from, message).await;
                    did_work = true;
                }
            }

            if !did_work {
                let owners: Vec<String> = self.active_modules.keys().cloned().collect();
                for owner in owners {
                    let received = self
                        .active_modules
                        .get(&owner)
                        .and_then(|active| active.group.try_recv(COMM_ANY_SOURCE, OpCode::Any));
                    if let Some((from, message)) = received {
                        self.handle_module_message(&owner, from, message).await;
                        did_work = true;
                        break;
                    }
                }
            }

            if !did_work {
                tokio::time::sleep(SLEEP_TIME).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Host;
    use std::collections::HashSet;

    fn cluster() -> ClusterConfig {
        ClusterConfig {
            hosts: vec![Host {
                name: "local".into(),
                is_database_server: false,
                resources: HashSet::new(),
                runtime_daemon_rank: 0,
                catalog_daemon_rank: None,
                ssh: None,
            }],
            running_dir: "/tmp".into(),
        }
    }

    fn descriptor(name: &str) -> ModuleDescriptor {
        ModuleDescriptor {
            name: name.into(),
            library_file: "true".into(),
            arguments: vec![],
            instances: 1,
            inputs: vec![],
            output: None,
            demands: HashSet::new(),
            running_directory: "/tmp".into(),
            assigned_catalog_rank: None,
        }
    }

    async fn daemon() -> RuntimeDaemon {
        RuntimeDaemon::start(
            0,
            true,
            cluster(),
            GroupHandle::solo(0),
            GroupHandle::solo(0),
            "127.0.0.1:0".into(),
            "127.0.0.1:0",
            "127.0.0.1:0",
        )
        .await
        .unwrap()
    }

    fn fake_active(name: &str) -> ActiveModule {
        ActiveModule {
            descriptor: descriptor(name),
            group: GroupHandle::solo(0),
            termination_acks: 0,
            ports: Vec::new(),
        }
    }

    #[tokio::test]
    async fn admitting_the_same_module_twice_is_rejected() {
        let mut d = daemon().await;
        d.active_modules.insert("m".into(), fake_active("m"));
        assert!(d.admit_module("m.toml", descriptor("m")).await.is_err());
    }

    #[tokio::test]
    async fn admission_is_rejected_when_a_peer_runtime_already_owns_the_module() {
        let (mine, theirs) = {
            let a = GroupHandle::solo(0);
            let b = GroupHandle::solo(1);
            a.join_local(1, b.own_inbox());
            b.join_local(0, a.own_inbox());
            (a, b)
        };
        let mut d = RuntimeDaemon::start(
            0,
            true,
            cluster(),
            mine,
            GroupHandle::solo(0),
            "127.0.0.1:0".into(),
            "127.0.0.1:0",
            "127.0.0.1:0",
        )
        .await
        .unwrap();

        let responder = tokio::spawn(async move {
            let (from, query) = theirs.recv(COMM_ANY_SOURCE, OpCode::ModuleRunningQuery).await;
            assert_eq!(query.payload_as_str(), "m");
            theirs.send(from, Message::text(OpCode::ModuleRunningAck, "1").unwrap()).unwrap();
        });

        assert!(d.admit_module("m.toml", descriptor("m")).await.is_err());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn admission_fails_when_no_host_satisfies_demands() {
        let mut d = daemon().await;
        let mut unsatisfiable = descriptor("m");
        unsatisfiable.demands.insert("gpu".into());
        assert!(d.admit_module("m.toml", unsatisfiable).await.is_err());
    }

    /// Drives the real spawn/accept/ready-gating path: a task standing in
    /// for the spawned instance dials into the runtime's module port,
    /// receives `INIT_PROCESSING_MODULE`, and reports a port, exactly as
    /// `ModuleInstance::initialize` would.
    #[tokio::test]
    async fn admission_succeeds_once_the_instance_completes_the_handshake() {
        let mut d = daemon().await;
        let module_addr = d.module_addr.clone();

        let instance = tokio::spawn(async move {
            let group = GroupHandle::solo(999_000);
            tcp::connect(&group, 0, &module_addr).await.unwrap();
            let (_, init) = group.recv(0, OpCode::InitModule).await;
            assert_eq!(init.payload_as_str(), "m.toml\t127.0.0.1:0\t0");
            group
                .send(0, Message::text(OpCode::PortName, "127.0.0.1:9").unwrap())
                .unwrap();
        });

        d.admit_module("m.toml", descriptor("m")).await.unwrap();
        instance.await.unwrap();
        assert_eq!(d.active_modules.get("m").unwrap().ports, vec!["127.0.0.1:9".to_string()]);
    }

    #[tokio::test]
    async fn removing_an_unowned_module_is_an_error() {
        let mut d = daemon().await;
        assert!(d.remove_module("ghost").await.is_err());
    }

    #[tokio::test]
    async fn shutdown_transitions_state_to_exit() {
        let mut d = daemon().await;
        d.shutdown().await.unwrap();
        assert_eq!(d.state(), RuntimeState::Exit);
    }
}
