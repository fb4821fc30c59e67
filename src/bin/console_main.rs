use clap::Parser;
use watershed::console::{self, ConsoleArgs};

#[tokio::main]
async fn main() {
    let args = ConsoleArgs::parse();
    match console::run(&args).await {
        Ok(reply) => {
            if !reply.is_empty() {
                println!("{reply}");
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}
