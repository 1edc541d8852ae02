//! Wire-protocol client for the Retcon daemon.

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpStream;
use url::Url;

use common::diff::DiffOp;
use common::ident::{ChangeNotification, DiffId, DiffOpId, EntityName, SourceName};
use common::protocol::{call, ConflictEntry, Request, Response};

/// Talk to a running Retcon daemon.
#[derive(Parser, Debug)]
#[command(name = "retcon-client", version, about)]
struct Args {
    /// Server address, e.g. tcp://127.0.0.1:60179.
    #[arg(long)]
    address: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tell the daemon a document changed in a source.
    Notify {
        entity: String,
        source: String,
        fid: String,
    },
    /// List conflicts awaiting resolution.
    ListConflicts,
    /// Resolve a conflict by accepting the given op ids.
    Resolve {
        diff_id: i64,
        #[arg(required = true)]
        op_ids: Vec<i64>,
    },
}

fn parse_address(address: &str) -> Result<SocketAddr> {
    let url = Url::parse(address).context("invalid address")?;
    if url.scheme() != "tcp" {
        bail!("unsupported scheme {:?}, expected tcp://", url.scheme());
    }
    let host = url.host_str().context("address is missing a host")?;
    let port = url.port().context("address is missing a port")?;
    format!("{host}:{port}")
        .parse()
        .context("address does not resolve to a socket address")
}

fn print_conflict(entry: &ConflictEntry) {
    println!("conflict {}", entry.diff_id);
    println!("  initial document:");
    if entry.initial.is_empty() {
        println!("    (empty)");
    }
    for (path, value) in entry.initial.iter() {
        println!("    {path} = {value:?}");
    }
    println!("  pending operations:");
    for (op_id, op) in &entry.ops {
        match op {
            DiffOp::Insert { path, value } => {
                println!("    [{op_id}] insert {path} = {value:?}")
            }
            DiffOp::Delete { path } => println!("    [{op_id}] delete {path}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let addr = parse_address(&args.address)?;

    let request = match &args.command {
        Command::Notify {
            entity,
            source,
            fid,
        } => {
            let entity: EntityName = entity.parse().context("invalid entity name")?;
            let source: SourceName = source.parse().context("invalid source name")?;
            Request::Change(ChangeNotification::new(entity, source, fid.clone()))
        }
        Command::ListConflicts => Request::ListConflicts,
        Command::Resolve { diff_id, op_ids } => Request::Resolve {
            diff_id: DiffId(*diff_id),
            op_ids: op_ids.iter().map(|id| DiffOpId(*id)).collect(),
        },
    };

    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("cannot connect to {addr}"))?;
    let response = call(&mut stream, &request).await?;

    match (args.command, response) {
        (Command::Notify { .. }, Response::Ack) => println!("change accepted"),
        (Command::Resolve { .. }, Response::Ack) => println!("resolution accepted"),
        (Command::ListConflicts, Response::Conflicts(entries)) => {
            if entries.is_empty() {
                println!("no conflicts");
            }
            for entry in &entries {
                print_conflict(entry);
            }
        }
        (_, other) => bail!("unexpected reply: {other:?}"),
    }
    Ok(())
}
