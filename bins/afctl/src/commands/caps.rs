//! afctl caps - report kernel capabilities.

use afsock::{AddressFamily, Capability, SocketKind, capabilities};
use clap::Args;

use crate::Output;

#[derive(Args)]
pub struct CapsCmd {
    /// Only check one capability; exit with failure if it is missing.
    #[arg(long)]
    check: Option<Capability>,
}

impl CapsCmd {
    pub fn run(&self, output: Output) -> anyhow::Result<()> {
        let caps = capabilities();

        if let Some(cap) = self.check {
            let present = caps.has(cap);
            if output.json {
                super::print_json(
                    &serde_json::json!({ "capability": cap.name(), "available": present }),
                    output.pretty,
                )?;
            } else {
                println!("{}: {}", cap, if present { "yes" } else { "no" });
            }
            if !present {
                anyhow::bail!("{cap} is not available");
            }
            return Ok(());
        }

        if output.json {
            super::print_json(&serde_json::to_value(caps)?, output.pretty)?;
            return Ok(());
        }

        println!("{:<20} {:<8} {:<10} SEQPACKET", "FAMILY", "STREAM", "DATAGRAM");
        for family in AddressFamily::ALL {
            let mark = |kind| if caps.supports(family, kind) { "yes" } else { "no" };
            println!(
                "{:<20} {:<8} {:<10} {}",
                family.name(),
                mark(SocketKind::Stream),
                mark(SocketKind::Datagram),
                mark(SocketKind::SequentialPacket),
            );
        }
        println!();
        for cap in Capability::ALL {
            println!("{:<20} {}", cap.name(), if caps.has(cap) { "yes" } else { "no" });
        }
        Ok(())
    }
}
