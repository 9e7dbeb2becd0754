//! afctl encode / decode - show address encodings.

use afsock::{AddressFamily, NativeAddress, SocketAddress};
use anyhow::Context;
use clap::{Args, ValueEnum};

use super::hex;
use crate::Output;

#[derive(Args)]
pub struct EncodeCmd {
    /// Address, e.g. unix:/run/app.sock, abstract:name, tipc:1000:1, vsock:2:5000.
    address: SocketAddress,
}

impl EncodeCmd {
    pub fn run(&self, output: Output) -> anyhow::Result<()> {
        let native = self.address.encode()?;
        print_address(&self.address, &native, output)
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FamilyArg {
    Unix,
    Tipc,
    Vsock,
}

impl From<FamilyArg> for AddressFamily {
    fn from(arg: FamilyArg) -> Self {
        match arg {
            FamilyArg::Unix => AddressFamily::Unix,
            FamilyArg::Tipc => AddressFamily::Tipc,
            FamilyArg::Vsock => AddressFamily::Vsock,
        }
    }
}

#[derive(Args)]
pub struct DecodeCmd {
    /// Address family of the raw bytes.
    #[arg(short = 'f', long, value_enum)]
    family: FamilyArg,

    /// Hex bytes, either as one string or separated by spaces.
    #[arg(required = true, num_args = 1..)]
    bytes: Vec<String>,
}

impl DecodeCmd {
    pub fn run(&self, output: Output) -> anyhow::Result<()> {
        let raw = parse_hex(&self.bytes.concat())?;
        let native = NativeAddress::from_raw(self.family.into(), &raw)?;
        let address = native.decode()?;
        print_address(&address, &native, output)
    }
}

fn parse_hex(text: &str) -> anyhow::Result<Vec<u8>> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if !digits.is_ascii() {
        anyhow::bail!("invalid hex input '{text}'");
    }
    if digits.len() % 2 != 0 {
        anyhow::bail!("odd number of hex digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}

fn print_address(
    address: &SocketAddress,
    native: &NativeAddress,
    output: Output,
) -> anyhow::Result<()> {
    if output.json {
        return super::print_json(
            &serde_json::json!({
                "address": address,
                "family": native.family().name(),
                "len": native.len(),
                "bytes": hex(native.as_bytes()),
            }),
            output.pretty,
        );
    }
    println!("address: {address}");
    println!("family:  {}", native.family());
    println!("length:  {}", native.len());
    println!("bytes:   {}", hex(native.as_bytes()));
    Ok(())
}
