//! Interactive client

use clap::Parser;
use minidb::client::{parse_node_arg, render, Client, Command};
use minidb::common::ClusterConfig;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};

#[derive(Parser)]
#[command(name = "minidb")]
#[command(about = "minidb interactive client")]
#[command(version)]
struct Cli {
    /// Node to connect to (host:port); prompted for when omitted
    #[arg(long)]
    addr: Option<String>,

    /// Cluster descriptor used to resolve redirects
    #[arg(long)]
    cluster: Option<PathBuf>,

    /// Cluster member as id=host:port (repeatable)
    #[arg(long = "node", value_name = "ID=HOST:PORT")]
    nodes: Vec<String>,

    /// Redirects followed per query
    #[arg(long, default_value_t = minidb::client::DEFAULT_MAX_REDIRECTS)]
    max_redirects: usize,
}

type Input = Lines<BufReader<Stdin>>;

async fn prompt(input: &mut Input, text: &str) -> anyhow::Result<Option<String>> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(text.as_bytes()).await?;
    stdout.flush().await?;
    Ok(input.next_line().await?.map(|l| l.trim().to_string()))
}

async fn ask_endpoint(input: &mut Input) -> anyhow::Result<Option<String>> {
    loop {
        match prompt(input, "node address (host:port): ").await? {
            None => return Ok(None),
            Some(addr) if addr.is_empty() => continue,
            Some(addr) => return Ok(Some(addr)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    let mut directory = match &cli.cluster {
        Some(path) => minidb::client::directory_of(&ClusterConfig::load(path)?),
        None => Default::default(),
    };
    for arg in &cli.nodes {
        let (id, addr) = parse_node_arg(arg)?;
        directory.insert(id, addr);
    }

    let endpoint = match cli.addr {
        Some(addr) => addr,
        None => match ask_endpoint(&mut input).await? {
            Some(addr) => addr,
            None => return Ok(()),
        },
    };

    let mut client = Client::connect_to(endpoint)
        .with_directory(directory)
        .with_max_redirects(cli.max_redirects);
    println!("connected to {} (:info, :node, :exit)", client.endpoint());

    while let Some(line) = prompt(&mut input, "minidb> ").await? {
        match Command::parse(&line) {
            Command::Empty => {}
            Command::Exit => break,
            Command::Info => println!("current node: {}", client.endpoint()),
            Command::Node => match ask_endpoint(&mut input).await? {
                Some(addr) => client.set_endpoint(addr),
                None => break,
            },
            Command::Query(query) => match client.query(&query).await {
                Ok(reply) => println!("{}", render(&reply)),
                Err(e) => println!("request failed: {}", e),
            },
        }
    }

    Ok(())
}
