//! afctl command - sockets beyond the Internet families.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "afctl", version, about = "Unix domain, TIPC and vsock socket tool")]
struct Cli {
    /// Output JSON.
    #[arg(short = 'j', long, global = true)]
    json: bool,

    /// Pretty print JSON.
    #[arg(short = 'p', long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show which socket families and features the kernel supports.
    #[command(visible_alias = "c")]
    Caps(commands::caps::CapsCmd),

    /// Listen on an address and print or echo what arrives.
    #[command(visible_alias = "s")]
    Serve(commands::serve::ServeCmd),

    /// Send a message to an address.
    Send(commands::send::SendCmd),

    /// Show the kernel encoding of an address.
    #[command(visible_alias = "e")]
    Encode(commands::encode::EncodeCmd),

    /// Decode raw address bytes.
    #[command(visible_alias = "d")]
    Decode(commands::encode::DecodeCmd),
}

/// Output settings shared by every command.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
    pub pretty: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output = Output {
        json: cli.json,
        pretty: cli.pretty,
    };

    let result = match cli.command {
        Command::Caps(cmd) => cmd.run(output),
        Command::Serve(cmd) => cmd.run(output).await,
        Command::Send(cmd) => cmd.run(output),
        Command::Encode(cmd) => cmd.run(output),
        Command::Decode(cmd) => cmd.run(output),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
