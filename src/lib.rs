/*!
# Watershed

A distributed stream-processing coordination kernel. Watershed runs a
dataflow graph of user-supplied processing modules across a cluster of
hosts: a runtime daemon per host admits, spawns and supervises module
instances; a catalog daemon tracks which modules produce and consume which
named streams so new instances can discover and connect to their peers;
and each module instance exchanges data with its neighbors under
credit-based flow control, routed by a declared distribution policy
(broadcast, round-robin, or a user-labeled mapping).

This crate is the coordination kernel only: peer discovery and connection
setup, flow control, distribution policies, and lifecycle coordination
(admission, instance removal, module removal, cluster shutdown) with
barrier-synchronized disconnects. Descriptor and cluster configuration
parsing, the user module/label-function loading mechanism, and the console
command-line surface are kept deliberately thin seams around this core.
*/
#[macro_use]
extern crate derivative;
#[macro_use]
extern crate tracing;

pub use descriptor::{ClusterConfig, Host, InputFlow, ModuleDescriptor, Policy};
pub use error::{Result, WatershedError};
pub use message::{Message, OpCode};
pub use module::{run_module_main, DataConsumer, DataProducer, LabelFunction, ModuleContext, ModuleInstance, ProcessingModule};
pub use scheduler::Scheduler;
pub use transport::GroupHandle;

pub mod catalog;
pub mod console;
pub mod constants;
pub mod descriptor;
pub mod error;
pub mod message;
pub mod module;
pub mod runtime;
pub mod scheduler;
pub mod transport;
