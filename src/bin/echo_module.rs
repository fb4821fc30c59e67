use async_trait::async_trait;
use clap::Parser;
use watershed::{run_module_main, Message, ModuleContext, ProcessingModule, Result};

#[derive(Parser, Debug)]
#[command(name = "watershed-echo-module", about = "Reference processing module: forwards its input to its output unchanged")]
struct Args {
    /// Rank assigned to this instance by the runtime that spawned it.
    #[arg(long)]
    rank: i32,

    /// Address of the runtime daemon to dial back into.
    #[arg(long)]
    runtime_addr: String,
}

struct EchoModule;

#[async_trait]
impl ProcessingModule for EchoModule {
    async fn process(&mut self, message: &Message, ctx: &mut ModuleContext<'_>) -> Result<()> {
        ctx.send(message.payload.clone()).await
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run_module_main(args.rank, &args.runtime_addr, Box::new(EchoModule)).await {
        eprintln!("echo module exited with error: {e}");
        std::process::exit(1);
    }
}
