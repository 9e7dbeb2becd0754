//! afctl send - deliver one message and optionally wait for a reply.

use std::io::{Read, Write};
use std::time::Duration;

use afsock::{AfDatagram, AfStream, SocketAddress, SocketKind};
use clap::Args;

use super::printable;
use crate::Output;

#[derive(Args)]
pub struct SendCmd {
    /// Destination address.
    address: SocketAddress,

    /// Message text.
    message: String,

    /// Socket kind: stream, datagram or seqpacket.
    #[arg(short = 'k', long, default_value = "stream")]
    kind: SocketKind,

    /// Wait for one reply and print it.
    #[arg(short = 'w', long)]
    wait_reply: bool,

    /// Connect and reply timeout in milliseconds.
    #[arg(short = 't', long, default_value_t = 5000)]
    timeout: u64,

    /// Local address to bind datagram sockets to (needed for replies).
    #[arg(short = 'b', long)]
    bind: Option<SocketAddress>,
}

impl SendCmd {
    pub fn run(&self, output: Output) -> anyhow::Result<()> {
        let timeout = Some(Duration::from_millis(self.timeout));
        let payload = self.message.as_bytes();

        let (sent, reply) = match self.kind {
            SocketKind::Stream => {
                let mut stream = AfStream::connect_timeout(&self.address, timeout)?;
                stream.set_read_timeout(timeout)?;
                stream.write_all(payload)?;
                let reply = if self.wait_reply {
                    let mut buf = vec![0u8; payload.len().max(1)];
                    stream.read_exact(&mut buf)?;
                    Some(buf)
                } else {
                    None
                };
                stream.close()?;
                (payload.len(), reply)
            }
            SocketKind::SequentialPacket => {
                let sock = AfDatagram::connect_seqpacket(&self.address)?;
                sock.set_read_timeout(timeout)?;
                let sent = sock.send(payload)?;
                let reply = if self.wait_reply {
                    Some(sock.receive(65536)?.data.to_vec())
                } else {
                    None
                };
                (sent, reply)
            }
            SocketKind::Datagram => {
                let sock = match &self.bind {
                    Some(local) => AfDatagram::bind(local)?,
                    None => AfDatagram::new(self.address.family(), SocketKind::Datagram)?,
                };
                sock.set_read_timeout(timeout)?;
                let sent = sock.send_to(payload, &self.address)?;
                let reply = if self.wait_reply {
                    Some(sock.receive(65536)?.data.to_vec())
                } else {
                    None
                };
                if let Some(path) = self.bind.as_ref().and_then(SocketAddress::as_path) {
                    let _ = std::fs::remove_file(path);
                }
                (sent, reply)
            }
        };

        if output.json {
            return super::print_json(
                &serde_json::json!({
                    "address": self.address,
                    "sent": sent,
                    "reply": reply.as_deref().map(printable),
                }),
                output.pretty,
            );
        }
        println!("sent {} bytes to {}", sent, self.address);
        if let Some(reply) = reply {
            println!("reply: {}", printable(&reply));
        }
        Ok(())
    }
}
