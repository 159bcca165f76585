//! A small command line client for Manifold plugins.
//!
//! Speaks the line-delimited JSON protocol against a plugin
//! addressed either by `--addr HOST:PORT` or by `--sock NAME`, where
//! `NAME` is a socket in the well-known run directory. Exits 0 on
//! success, 1 on any error.

use clap::{Arg, ArgAction, ArgMatches, Command};
use manifold_api::proto;
use std::process::ExitCode;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpStream, UnixStream},
};

fn cli() -> Command {
    let device_arg = Arg::new("device")
        .required(true)
        .value_name("DEVICE-ID")
        .help("The target device's ID");

    Command::new("manifold-cli")
        .about("Talks to a Manifold device plugin.")
        .subcommand_required(true)
        .arg(
            Arg::new("sock")
                .long("sock")
                .action(ArgAction::Set)
                .value_name("NAME")
                .conflicts_with("addr")
                .help("Plugin socket name under the run directory"),
        )
        .arg(
            Arg::new("addr")
                .long("addr")
                .action(ArgAction::Set)
                .value_name("HOST:PORT")
                .help("Plugin TCP address"),
        )
        .subcommand(
            Command::new("read")
                .about("Shows the latest readings for a device")
                .arg(device_arg.clone()),
        )
        .subcommand(
            Command::new("write")
                .about("Writes to a device and waits for the result")
                .arg(device_arg.clone())
                .arg(
                    Arg::new("action")
                        .required(true)
                        .value_name("ACTION"),
                )
                .arg(
                    Arg::new("raw")
                        .value_name("RAW")
                        .help("Optional raw payload"),
                ),
        )
        .subcommand(
            Command::new("transaction")
                .about("Shows the state of a write transaction")
                .arg(
                    Arg::new("id")
                        .required(true)
                        .value_name("TXN-ID"),
                ),
        )
        .subcommand(
            Command::new("metainfo")
                .about("Lists the devices the plugin manages")
                .arg(
                    Arg::new("filter")
                        .long("filter")
                        .action(ArgAction::Append)
                        .value_name("KEY=VALUE")
                        .help(
                            "Narrows the listing, e.g. type=airflow \
                             or handler=pusher",
                        ),
                ),
        )
        .subcommand(
            Command::new("health")
                .about("Shows the plugin's health checks"),
        )
}

fn build_request(matches: &ArgMatches) -> proto::Request {
    match matches.subcommand() {
        Some(("read", sub)) => proto::Request::Read {
            device: sub.get_one::<String>("device").unwrap().clone(),
        },
        Some(("write", sub)) => proto::Request::WriteSync {
            device: sub.get_one::<String>("device").unwrap().clone(),
            payload: vec![proto::WritePayload {
                action: sub.get_one::<String>("action").cloned(),
                raw: sub
                    .get_one::<String>("raw")
                    .map(|raw| raw.as_bytes().to_vec()),
                transaction: None,
            }],
        },
        Some(("transaction", sub)) => proto::Request::Transaction {
            id: sub.get_one::<String>("id").unwrap().clone(),
        },
        Some(("metainfo", sub)) => proto::Request::Metainfo {
            filter: sub
                .get_many::<String>("filter")
                .map(|filters| filters.cloned().collect())
                .unwrap_or_default(),
        },
        Some(("health", _)) => proto::Request::Health,
        _ => unreachable!("a subcommand is required"),
    }
}

// One request, one reply, over whichever transport was selected.

async fn round_trip(
    matches: &ArgMatches,
    request: &proto::Request,
) -> Result<proto::Response, String> {
    let mut encoded = serde_json::to_vec(request)
        .map_err(|e| format!("couldn't encode request: {}", e))?;

    encoded.push(b'\n');

    let line = if let Some(name) = matches.get_one::<String>("sock") {
        let path = if name.contains('/') {
            name.clone()
        } else {
            format!("{}/{}.sock", proto::RUN_DIR, name)
        };
        let stream = UnixStream::connect(&path)
            .await
            .map_err(|e| format!("couldn't connect '{}': {}", path, e))?;

        exchange(stream, &encoded).await?
    } else if let Some(addr) = matches.get_one::<String>("addr") {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| format!("couldn't connect '{}': {}", addr, e))?;

        exchange(stream, &encoded).await?
    } else {
        return Err(String::from("pass either --sock or --addr"));
    };

    serde_json::from_str(&line)
        .map_err(|e| format!("unparseable reply: {}", e))
}

async fn exchange<S>(stream: S, encoded: &[u8]) -> Result<String, String>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);

    writer
        .write_all(encoded)
        .await
        .map_err(|e| format!("send failed: {}", e))?;

    BufReader::new(reader)
        .lines()
        .next_line()
        .await
        .map_err(|e| format!("receive failed: {}", e))?
        .ok_or_else(|| String::from("plugin closed the connection"))
}

fn render(response: proto::Response) -> Result<(), String> {
    match response {
        proto::Response::Devices { devices } => {
            for dev in devices {
                let caps = &dev.capabilities;
                let caps = [
                    caps.read.then_some("read"),
                    caps.write.then_some("write"),
                    caps.listen.then_some("listen"),
                ]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(",");

                println!(
                    "{}  type={} handler={} caps={} outputs={}",
                    dev.id,
                    dev.kind,
                    dev.handler,
                    caps,
                    dev.outputs.join(",")
                )
            }
            Ok(())
        }

        proto::Response::Readings { readings } => {
            for reading in readings {
                print_reading(&reading)
            }
            Ok(())
        }

        proto::Response::Window { entries } => {
            for entry in entries {
                println!("-- {}", entry.ts);
                for reading in entry.readings {
                    print_reading(&reading)
                }
            }
            Ok(())
        }

        proto::Response::Writes { transactions } => {
            for receipt in transactions {
                println!("{}  {}", receipt.id, receipt.data)
            }
            Ok(())
        }

        proto::Response::Transactions { transactions } => {
            let mut failed = false;

            for txn in transactions {
                println!(
                    "{}  {}  created={} updated={} {}",
                    txn.id, txn.state, txn.created, txn.updated,
                    txn.message
                );
                failed = failed
                    || txn.state
                        == manifold_api::types::transaction::State::Error
            }

            if failed {
                Err(String::from("write failed"))
            } else {
                Ok(())
            }
        }

        proto::Response::Health { status } => {
            println!("{}  ts={}", ok_str(status.ok), status.ts);
            for check in status.checks {
                println!(
                    "  {}  {}{}",
                    ok_str(check.ok),
                    check.name,
                    check
                        .message
                        .map(|m| format!(" -- {}", m))
                        .unwrap_or_default()
                )
            }

            if status.ok {
                Ok(())
            } else {
                Err(String::from("plugin is unhealthy"))
            }
        }

        proto::Response::Error { error } => {
            Err(format!("{}: {}", error.kind, error.message))
        }
    }
}

fn print_reading(reading: &proto::Reading) {
    let unit = if reading.unit.symbol.is_empty() {
        String::new()
    } else {
        format!(" {}", reading.unit.symbol)
    };

    println!(
        "{}  {} = {}{}",
        reading.ts,
        reading.kind,
        serde_json::to_string(&reading.value)
            .unwrap_or_else(|_| String::from("?")),
        unit
    )
}

fn ok_str(ok: bool) -> &'static str {
    if ok {
        "OK"
    } else {
        "FAILING"
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();
    let request = build_request(&matches);

    match round_trip(&matches, &request).await.and_then(render) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            ExitCode::FAILURE
        }
    }
}
