use std::net::SocketAddr;

use clap::Parser;
use primary_kv::{
    client::{now, GetOutcome, PutCompletion},
    channel::Inbox,
    task::{SessionSpawner, Supervisor},
    Client,
};
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Cli {
    /// Address the completion listener binds and advertises.
    #[clap(long)]
    listen: Option<SocketAddr>,
    /// Replicas to talk to. Only meaningful together with `--listen`.
    #[clap(long = "replica", requires = "listen")]
    replicas: Vec<SocketAddr>,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Init {
        listen: SocketAddr,
        replicas: Vec<SocketAddr>,
    },
    Put {
        key: String,
        value: String,
    },
    Get {
        key: String,
    },
    Exit,
}

fn parse(line: &str) -> Result<Command, String> {
    let parts = line.split_whitespace().collect::<Vec<_>>();
    let Some(operation) = parts.first() else {
        return Err("empty command".into());
    };
    match operation.to_uppercase().as_str() {
        "INIT" if parts.len() >= 3 => {
            let parse_addr = |s: &str| {
                s.parse::<SocketAddr>()
                    .map_err(|err| format!("invalid address {s}: {err}"))
            };
            Ok(Command::Init {
                listen: parse_addr(parts[1])?,
                replicas: parts[2..]
                    .iter()
                    .map(|s| parse_addr(*s))
                    .collect::<Result<_, _>>()?,
            })
        }
        "PUT" if parts.len() == 3 => Ok(Command::Put {
            key: parts[1].into(),
            value: parts[2].into(),
        }),
        "GET" if parts.len() == 2 => Ok(Command::Get {
            key: parts[1].into(),
        }),
        "EXIT" if parts.len() == 1 => Ok(Command::Exit),
        _ => Err(
            "usage: INIT <client-addr> <server>..., PUT <key> <value>, GET <key>, exit".into(),
        ),
    }
}

async fn start(
    listen: SocketAddr,
    replicas: Vec<SocketAddr>,
    spawner: &SessionSpawner,
) -> primary_kv::Result<Client> {
    let (client, completions) = Client::start(listen, replicas, spawner).await?;
    spawner.spawn("console output", print_completions(completions));
    Ok(client)
}

async fn print_completions(mut completions: Inbox<PutCompletion>) -> primary_kv::Result<()> {
    while let Some(completion) = completions.recv().await {
        println!(
            "PUT_OK key: {} value {} timestamp {} performed on server {}",
            completion.key, completion.value, completion.server_timestamp, completion.server_addr
        )
    }
    Ok(())
}

async fn execute(client: &Client, command: Command) -> primary_kv::Result<()> {
    match command {
        Command::Put { key, value } => {
            let sent = client.put(key, value).await?;
            tracing::debug!("PUT sent to {} ts:{}", sent.replica, sent.client_timestamp)
        }
        Command::Get { key } => {
            let (value, server_timestamp, replica) = match client.get(&key).await? {
                GetOutcome::Value {
                    value,
                    server_timestamp,
                    replica,
                } => (value, server_timestamp, replica),
                GetOutcome::NotFound { replica } => ("NULL".into(), 0, replica),
                GetOutcome::Retry {
                    server_timestamp,
                    replica,
                } => ("TRY_OTHER_SERVER_OR_LATER".into(), server_timestamp, replica),
            };
            println!(
                "GET key: {key} value: {value} obtained from server {replica}, \
                my timestamp {} server timestamp {server_timestamp}",
                now()
            )
        }
        Command::Init { .. } | Command::Exit => {
            primary_kv::bail!("{command:?} is handled by the console loop")
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> primary_kv::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut supervisor = Supervisor::default();
    let spawner = supervisor.spawner();
    let mut client = match cli.listen {
        Some(listen) => Some(start(listen, cli.replicas, &spawner).await?),
        None => None,
    };

    let mut lines = BufReader::new(stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            result = supervisor.wait() => return result,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse(&line) {
            Ok(command) => command,
            Err(err) => {
                eprintln!("{err}");
                continue;
            }
        };
        let (listen, replicas) = match command {
            Command::Exit => {
                println!("Closing the client...");
                break;
            }
            Command::Init { listen, replicas } => (listen, replicas),
            command => {
                match &client {
                    Some(client) => {
                        if let Err(err) = execute(client, command).await {
                            eprintln!("{err:#}")
                        }
                    }
                    None => eprintln!("run INIT <client-addr> <server>... first"),
                }
                continue;
            }
        };
        if client.is_some() {
            eprintln!("client already initialized");
            continue;
        }
        match start(listen, replicas, &spawner).await {
            Ok(started) => client = Some(started),
            Err(err) => eprintln!("{err:#}"),
        }
    }
    supervisor.shutdown();
    Ok(())
}
