//! afctl serve - accept connections or messages and print them.

use std::os::unix::fs::FileTypeExt;

use afsock::{
    AfDatagram, AfStream, AsyncAfDatagram, AsyncAfListener, AsyncAfStream, ListenerBuilder,
    SocketAddress, SocketKind,
};
use clap::Args;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinSet;

use super::printable;
use crate::Output;

#[derive(Args, Clone)]
pub struct ServeCmd {
    /// Address to listen on.
    address: SocketAddress,

    /// Socket kind: stream, datagram or seqpacket.
    #[arg(short = 'k', long, default_value = "stream")]
    kind: SocketKind,

    /// Send everything received back to the sender.
    #[arg(short = 'e', long)]
    echo: bool,

    /// Exit after this many connections (or datagrams).
    #[arg(short = 'c', long)]
    count: Option<usize>,

    /// Remove a stale socket file before binding.
    #[arg(long)]
    remove_existing: bool,

    /// Receive buffer size in bytes.
    #[arg(long, default_value_t = 65536)]
    buffer: usize,
}

impl ServeCmd {
    pub async fn run(&self, output: Output) -> anyhow::Result<()> {
        match self.kind {
            SocketKind::Stream => self.serve_stream(output).await,
            SocketKind::SequentialPacket => self.serve_seqpacket(output).await,
            SocketKind::Datagram => self.serve_datagram(output).await,
        }
    }

    fn listener_builder(&self) -> ListenerBuilder {
        ListenerBuilder::new(self.address.clone())
            .remove_existing(self.remove_existing)
            .unlink_on_close(true)
    }

    fn more(&self, served: usize) -> bool {
        self.count.is_none_or(|count| served < count)
    }

    fn announce(&self, output: Output) {
        if !output.json {
            println!("listening on {} ({})", self.address, self.kind);
        }
    }

    async fn serve_stream(&self, output: Output) -> anyhow::Result<()> {
        let listener: AsyncAfListener =
            AsyncAfListener::new(self.listener_builder().bind::<AfStream>()?)?;
        self.announce(output);

        let mut tasks = JoinSet::new();
        let mut served = 0;
        while self.more(served) {
            let (conn, peer) = listener.accept().await?;
            served += 1;
            tracing::debug!(%peer, "accepted connection");
            tasks.spawn(stream_session(conn, peer, self.echo, self.buffer, output));
        }
        while let Some(result) = tasks.join_next().await {
            result??;
        }
        Ok(())
    }

    async fn serve_seqpacket(&self, output: Output) -> anyhow::Result<()> {
        let listener: AsyncAfListener<AfDatagram> =
            AsyncAfListener::new(self.listener_builder().bind::<AfDatagram>()?)?;
        self.announce(output);

        let mut tasks = JoinSet::new();
        let mut served = 0;
        while self.more(served) {
            let (conn, peer) = listener.accept().await?;
            served += 1;
            tasks.spawn(packet_session(conn, peer, self.echo, self.buffer, output));
        }
        while let Some(result) = tasks.join_next().await {
            result??;
        }
        Ok(())
    }

    async fn serve_datagram(&self, output: Output) -> anyhow::Result<()> {
        if self.remove_existing {
            remove_stale_socket(&self.address);
        }
        let sock = AsyncAfDatagram::bind(&self.address)?;
        self.announce(output);

        let mut buf = vec![0u8; self.buffer];
        let mut served = 0;
        let result = async {
            while self.more(served) {
                let got = sock.recv_from(&mut buf).await?;
                served += 1;
                let data = &buf[..got.len];
                report(output, got.peer.as_ref(), data, got.truncated)?;
                if self.echo
                    && let Some(peer) = got.peer.as_ref().filter(|p| **p != SocketAddress::Unnamed)
                {
                    sock.send_to(data, peer).await?;
                }
            }
            anyhow::Ok(())
        }
        .await;

        if let Some(path) = self.address.as_path() {
            let _ = std::fs::remove_file(path);
        }
        result
    }
}

/// Remove `addr`'s file if it is a leftover socket.
fn remove_stale_socket(addr: &SocketAddress) {
    let Some(path) = addr.as_path() else {
        return;
    };
    if let Ok(meta) = std::fs::symlink_metadata(path)
        && meta.file_type().is_socket()
    {
        let _ = std::fs::remove_file(path);
    }
}

async fn stream_session(
    mut conn: AsyncAfStream,
    peer: SocketAddress,
    echo: bool,
    buffer: usize,
    output: Output,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; buffer.max(1)];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        report(output, Some(&peer), &buf[..n], false)?;
        if echo {
            conn.write_all(&buf[..n]).await?;
        }
    }
    conn.shutdown().await?;
    Ok(())
}

async fn packet_session(
    conn: AsyncAfDatagram,
    peer: SocketAddress,
    echo: bool,
    buffer: usize,
    output: Output,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; buffer.max(1)];
    loop {
        let got = conn.recv(&mut buf).await?;
        if got.len == 0 && !got.truncated {
            break;
        }
        report(output, Some(&peer), &buf[..got.len], got.truncated)?;
        if echo {
            conn.send(&buf[..got.len]).await?;
        }
    }
    Ok(())
}

fn report(
    output: Output,
    peer: Option<&SocketAddress>,
    data: &[u8],
    truncated: bool,
) -> anyhow::Result<()> {
    if output.json {
        return super::print_json(
            &serde_json::json!({
                "peer": peer,
                "len": data.len(),
                "truncated": truncated,
                "data": printable(data),
            }),
            output.pretty,
        );
    }
    let from = peer.map_or_else(|| "unknown".to_string(), ToString::to_string);
    let marker = if truncated { " (truncated)" } else { "" };
    println!("{from}: {}{marker}", printable(data));
    Ok(())
}
