//! The console client (§4.5): a single-shot command sent to the root
//! runtime, dialed via the port recorded in `watershed.info`.

use std::path::Path;

use clap::{Parser, Subcommand};

use crate::error::{Result, WatershedError};
use crate::message::{Message, OpCode};
use crate::runtime::files;
use crate::transport::tcp;
use crate::transport::GroupHandle;

#[derive(Parser, Debug)]
#[command(name = "watershed-console", about = "Administer a running Watershed cluster")]
pub struct ConsoleArgs {
    /// Directory containing the target runtime's watershed.info file.
    #[arg(long, default_value = ".")]
    pub running_dir: String,

    #[command(subcommand)]
    pub command: ConsoleCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConsoleCommand {
    /// Add a processing module from its descriptor file (`-i`).
    Add { descriptor_path: String },
    /// Remove a processing module by name (`-c`).
    Remove { module_name: String },
    /// Remove a single instance of a module (`-a`).
    RemoveInstance { module_name: String, instance: i32 },
    /// Shut the whole cluster down.
    Shutdown,
}

impl ConsoleCommand {
    fn wire(&self) -> Result<Message> {
        match self {
            ConsoleCommand::Add { descriptor_path } => {
                Message::text(OpCode::AddModule, descriptor_path)
            }
            ConsoleCommand::Remove { module_name } => {
                Message::text(OpCode::RemoveModule, module_name)
            }
            ConsoleCommand::RemoveInstance { module_name, instance } => {
                Message::text(OpCode::RemoveInstance, &format!("{module_name}\t{instance}"))
            }
            ConsoleCommand::Shutdown => Message::new(OpCode::Shutdown, Vec::new()),
        }
    }

    fn expected_ack(&self) -> OpCode {
        match self {
            ConsoleCommand::Add { .. } => OpCode::AddModuleAck,
            ConsoleCommand::Remove { .. } => OpCode::RemoveModuleAck,
            ConsoleCommand::RemoveInstance { .. } => OpCode::RemoveInstanceAck,
            ConsoleCommand::Shutdown => OpCode::ShutdownAck,
        }
    }
}

/// Runs one console command to completion: connect, send, await the
/// matching ack (or an error reply), disconnect. No retries (§4.5).
pub async fn run(args: &ConsoleArgs) -> Result<String> {
    let running_dir = Path::new(&args.running_dir);
    let console_port = files::read_info_file(running_dir)?;

    let group = GroupHandle::solo(0);
    tcp::connect(&group, 1, &console_port).await?;

    let request = args.command.wire()?;
    group.send(1, request)?;

    let (_, reply) = group.recv(1, OpCode::Any).await;
    group.disconnect().await;

    if reply.op_code == args.command.expected_ack() {
        Ok(reply.payload_as_str().into_owned())
    } else {
        Err(WatershedError::Transport(format!(
            "runtime rejected the command: {}",
            reply.payload_as_str()
        )))
    }
}
