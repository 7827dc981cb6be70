use anyhow::{Context, Result};
use bytes::Bytes;
use crypt_etcd::{
    backend::etcd::{EtcdConfig, DEFAULT_TIMEOUT},
    Backend, EtcdBackend,
};
use std::time::Duration;
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(StructOpt)]
struct Opts {
    /// etcd endpoint, may be repeated.
    #[structopt(short, long = "endpoint", default_value = "http://127.0.0.1:2379")]
    endpoints: Vec<String>,

    /// Timeout in seconds for connecting and for each call; 0 falls back to
    /// the 5 second default.
    #[structopt(short, long, default_value = "5")]
    timeout_secs: u64,

    #[structopt(subcommand)]
    cmd: Cmd,
}

#[derive(StructOpt)]
enum Cmd {
    /// Prints the value stored under a key.
    Get { key: String },
    /// Prints every key and value under a prefix.
    List { prefix: String },
    /// Stores a value under a key.
    Set { key: String, value: String },
    /// Prints every change under a prefix until interrupted.
    Watch { prefix: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();

    let opts = Opts::from_args();

    run_with(opts).await
}

async fn run_with(opts: Opts) -> Result<()> {
    let timeout = match opts.timeout_secs {
        0 => DEFAULT_TIMEOUT,
        secs => Duration::from_secs(secs),
    };
    let config = EtcdConfig::new(opts.endpoints).with_timeout(timeout);

    let mut backend = EtcdBackend::connect(config).await?;

    match opts.cmd {
        Cmd::Get { key } => {
            let value = backend
                .get(&key)
                .await?
                .with_context(|| format!("no value under key {}", key))?;
            println!("{}", String::from_utf8_lossy(&value));
        }
        Cmd::List { prefix } => {
            for pair in backend.list(&prefix).await? {
                println!("{} {}", pair.key, String::from_utf8_lossy(&pair.value));
            }
        }
        Cmd::Set { key, value } => {
            backend.set(key, Bytes::from(value)).await?;
        }
        Cmd::Watch { prefix } => watch(&backend, &prefix).await?,
    }

    Ok(())
}

async fn watch(backend: &EtcdBackend, prefix: &str) -> Result<()> {
    let stop = CancellationToken::new();
    let mut responses = backend.watch(prefix, stop.clone());

    let interrupt = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted");
        }
        interrupt.cancel();
    });

    while let Some(res) = responses.recv().await {
        match res {
            Ok(value) => println!("{}", String::from_utf8_lossy(&value)),
            Err(e) => {
                error!(reason = %e, "watch ended");
                return Err(e);
            }
        }
    }
    Ok(())
}

fn init_logger() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init()
}
