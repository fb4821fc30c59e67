//! The catalog daemon (§4.2): authoritative `module_name -> descriptor`
//! registry, producer/consumer discovery, and a rendezvous port for new
//! module groups to connect through.
//!
//! The descriptor store sits behind the [`CatalogStore`] trait so the
//! in-memory table used here can later be swapped for a persistent one
//! without touching the dispatch loop.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::constants::{COMM_ANY_SOURCE, SLEEP_TIME};
use crate::descriptor::{self, ModuleDescriptor};
use crate::error::Result;
use crate::message::{Message, OpCode};
use crate::transport::GroupHandle;
use crate::transport::tcp::Port;

/// Seam over the module table so the catalog's dispatch logic doesn't care
/// whether entries live in a `HashMap` or a persistent store.
pub trait CatalogStore: Send + Sync {
    fn insert(&self, name: String, descriptor: ModuleDescriptor);
    fn remove(&self, name: &str) -> Option<ModuleDescriptor>;
    fn get(&self, name: &str) -> Option<ModuleDescriptor>;
    fn consumers_of(&self, producer_name: &str) -> Vec<String>;
    /// Producers feeding `consumer_name`'s declared inputs, optionally
    /// narrowed to a single flow when the consumer wants to connect one
    /// input at a time rather than discover all of them at once.
    fn producers_of(&self, consumer_name: &str, flow_name: Option<&str>) -> Vec<String>;
}

#[derive(Default)]
pub struct InMemoryCatalogStore {
    modules: RwLock<HashMap<String, ModuleDescriptor>>,
}

impl CatalogStore for InMemoryCatalogStore {
    fn insert(&self, name: String, descriptor: ModuleDescriptor) {
        self.modules.write().insert(name, descriptor);
    }

    fn remove(&self, name: &str) -> Option<ModuleDescriptor> {
        self.modules.write().remove(name)
    }

    fn get(&self, name: &str) -> Option<ModuleDescriptor> {
        self.modules.read().get(name).cloned()
    }

    fn consumers_of(&self, producer_name: &str) -> Vec<String> {
        let modules = self.modules.read();
        let Some(producer) = modules.get(producer_name) else {
            return Vec::new();
        };
        let Some(output) = &producer.output else {
            return Vec::new();
        };
        modules
            .values()
            .filter(|m| m.inputs.iter().any(|i| i.name == output.flow_name))
            .map(|m| m.name.clone())
            .collect()
    }

    fn producers_of(&self, consumer_name: &str, flow_name: Option<&str>) -> Vec<String> {
        let modules = self.modules.read();
        let Some(consumer) = modules.get(consumer_name) else {
            return Vec::new();
        };
        let input_names: Vec<&str> = match flow_name {
            Some(f) => vec![f],
            None => consumer.inputs.iter().map(|i| i.name.as_str()).collect(),
        };
        modules
            .values()
            .filter(|m| {
                m.output
                    .as_ref()
                    .is_some_and(|o| input_names.contains(&o.flow_name.as_str()))
            })
            .map(|m| m.name.clone())
            .collect()
    }
}

pub struct CatalogDaemon {
    store: Arc<dyn CatalogStore>,
    runtimes: GroupHandle,
    port: Port,
    pending_connects: Arc<std::sync::atomic::AtomicUsize>,
}

impl CatalogDaemon {
    pub async fn start(runtimes: GroupHandle, bind_addr: &str) -> Result<Self> {
        let port = Port::open(bind_addr).await?;
        Ok(CatalogDaemon {
            store: Arc::new(InMemoryCatalogStore::default()),
            runtimes,
            port,
            pending_connects: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        })
    }

    pub fn advertised_port(&self) -> &str {
        self.port.advertised()
    }

    pub fn store(&self) -> Arc<dyn CatalogStore> {
        self.store.clone()
    }

    /// Handles a single inbound control message. Returns `Ok(true)` if the
    /// shutdown barrier was reached and this daemon should exit.
    async fn handle(&mut self, from: i32, message: Message) -> Result<bool> {
        match message.op_code {
            OpCode::AddModule => {
                let path = message.payload_as_str().to_string();
                match descriptor::load(std::path::Path::new(&path)) {
                    Ok(d) => self.store.insert(d.name.clone(), d),
                    Err(e) => {
                        tracing::warn!(from, "failed to parse descriptor {path}: {e}");
                        let _ = self.runtimes.send(
                            from,
                            Message::text(OpCode::ParserError, &e.to_string())?,
                        );
                    }
                }
            }
            OpCode::QueryConsumers => {
                let name = message.payload_as_str().to_string();
                let reply = self.store.consumers_of(&name).join(" ");
                self.runtimes.send(from, Message::text(OpCode::QueryConsumers, &reply)?)?;
            }
            OpCode::QueryProducers => {
                let text = message.payload_as_str().to_string();
                let mut parts = text.splitn(2, '\t');
                let consumer_name = parts.next().unwrap_or_default().to_string();
                let flow = parts.next().map(str::to_string);
                let reply = self.store.producers_of(&consumer_name, flow.as_deref()).join(" ");
                self.runtimes.send(from, Message::text(OpCode::QueryProducers, &reply)?)?;
            }
            OpCode::RemoveModule => {
                let name = message.payload_as_str().to_string();
                self.store.remove(&name);
            }
            OpCode::RemoveInstance => {
                // The instance's own peer-group re-creation happens on the
                // module side (§4.4.3); the catalog only needs to forget
                // nothing, since it tracks descriptors, not instance ranks.
            }
            OpCode::AcceptConnect => {
                self.pending_connects.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
            OpCode::Shutdown => {
                self.runtimes.barrier().await;
                return Ok(true);
            }
            _ => {}
        }
        Ok(false)
    }

    /// Accepts one rendezvous connect if `ACCEPT_CONNECT` was previously
    /// signalled; wires the new peer into `group` under `remote_rank`.
    pub async fn accept_pending_connect(&self, group: &GroupHandle, remote_rank: i32) -> Result<bool> {
        if self.pending_connects.load(std::sync::atomic::Ordering::SeqCst) == 0 {
            return Ok(false);
        }
        self.port.accept_one(group, remote_rank).await?;
        self.pending_connects.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        Ok(true)
    }

    pub async fn run(&mut self) -> Result<()> {
        loop {
            if let Some((from, message)) = self.runtimes.try_recv(COMM_ANY_SOURCE, OpCode::Any) {
                if self.handle(from, message).await? {
                    return Ok(());
                }
            } else {
                tokio::time::sleep(SLEEP_TIME).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn descriptor(name: &str, output: Option<&str>, inputs: &[&str]) -> ModuleDescriptor {
        ModuleDescriptor {
            name: name.into(),
            library_file: "lib".into(),
            arguments: vec![],
            instances: 1,
            inputs: inputs
                .iter()
                .map(|n| descriptor::InputFlow {
                    name: n.to_string(),
                    query: None,
                    policy: descriptor::Policy::Broadcast,
                    policy_function_file: None,
                })
                .collect(),
            output: output.map(|o| descriptor::Output {
                flow_name: o.to_string(),
                structure: "none".into(),
            }),
            demands: HashSet::new(),
            running_directory: "/tmp".into(),
            assigned_catalog_rank: None,
        }
    }

    #[test]
    fn consumers_of_matches_on_declared_input_stream() {
        let store = InMemoryCatalogStore::default();
        store.insert("src".into(), descriptor("src", Some("s"), &[]));
        store.insert("snk".into(), descriptor("snk", None, &["s"]));
        store.insert("other".into(), descriptor("other", None, &["t"]));
        assert_eq!(store.consumers_of("src"), vec!["snk".to_string()]);
    }

    #[test]
    fn producers_of_matches_on_declared_output_stream() {
        let store = InMemoryCatalogStore::default();
        store.insert("src".into(), descriptor("src", Some("s"), &[]));
        store.insert("snk".into(), descriptor("snk", None, &["s"]));
        assert_eq!(store.producers_of("snk", None), vec!["src".to_string()]);
    }

    #[test]
    fn producers_of_can_be_narrowed_to_a_single_flow() {
        let store = InMemoryCatalogStore::default();
        store.insert("a".into(), descriptor("a", Some("x"), &[]));
        store.insert("b".into(), descriptor("b", Some("y"), &[]));
        store.insert("snk".into(), descriptor("snk", None, &["x", "y"]));
        assert_eq!(store.producers_of("snk", Some("x")), vec!["a".to_string()]);
        assert_eq!(store.producers_of("snk", Some("y")), vec!["b".to_string()]);
    }

    #[test]
    fn unknown_module_has_no_consumers_or_producers() {
        let store = InMemoryCatalogStore::default();
        assert!(store.consumers_of("ghost").is_empty());
        assert!(store.producers_of("ghost", None).is_empty());
    }
}
