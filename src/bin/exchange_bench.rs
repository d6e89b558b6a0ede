use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use lazy_static::lazy_static;
use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_derive::Serialize;

use rshuffle::common::config::{ClusterConfig, StrategyKind};
use rshuffle::common::logs::init_log;
use rshuffle::common::membership::{StaticAddressTable, StaticMembership};
use rshuffle::common::payload::{Payload, TuplePayload};
use rshuffle::common::poller::CancelToken;
use rshuffle::exchange::{
    ExchangeSession, SendExchange, SessionReport, SourceTable, StructuredRecordBuffer, WriteExchange,
};
use rshuffle::rdma::control::ConnectionCollection;
use rshuffle::rdma::loopback::LoopbackFabric;
use rshuffle::{TransError, TransResult};

lazy_static! {
    // cancel switches of every live collection, fired by ctrl-c or the watchdog
    static ref CANCELLERS: Mutex<Vec<CancelToken>> = Mutex::new(Vec::new());
}

fn cancel_all() {
    for token in CANCELLERS.lock().unwrap().iter() {
        token.cancel();
    }
}

#[derive(Parser, Debug)]
#[clap(name = "exchange_bench")]
#[clap(about = "All-to-all record shuffle over the remote-memory transport")]
struct Cli {
    /// Processes in the group (loopback mode)
    #[clap(long, default_value = "2")]
    ranks: usize,

    /// Source records per rank
    #[clap(long, default_value = "100000")]
    records: usize,

    /// write | send
    #[clap(long)]
    strategy: Option<StrategyKind>,

    /// Ring slots per directed pair
    #[clap(long)]
    slots: Option<usize>,

    /// Bytes per record buffer
    #[clap(long)]
    buffer_bytes: Option<usize>,

    /// Sender tasks per peer (write strategy)
    #[clap(long)]
    producers: Option<usize>,

    /// Cluster configuration (JSON)
    #[clap(long)]
    config: Option<String>,

    /// Also log into this file
    #[clap(long)]
    log: Option<String>,

    /// Abort the run after this many seconds
    #[clap(long, default_value = "120")]
    timeout_secs: u64,

    /// Seed of the synthetic tables
    #[clap(long, default_value = "7")]
    seed: u64,
}

#[derive(Debug, Serialize)]
struct RankReport {
    rank: usize,
    #[serde(flatten)]
    session: SessionReport,
    misrouted: usize,
    /// records moved by the whole group, known at rank 0
    group_moved: Option<u64>,
}

fn build_config(cli: &Cli) -> TransResult<ClusterConfig> {
    let mut config = match &cli.config {
        Some(path) => ClusterConfig::from_json_file(path)?,
        None => ClusterConfig::default(),
    };
    if let Some(strategy) = cli.strategy {
        config.exchange.strategy = strategy;
    }
    if let Some(slots) = cli.slots {
        config.exchange.slots = slots;
    }
    if let Some(bytes) = cli.buffer_bytes {
        config.exchange.buffer_bytes = bytes;
    }
    if let Some(producers) = cli.producers {
        config.exchange.producers_per_peer = producers;
    }
    config.transport.validate()?;
    config.exchange.validate(TuplePayload::WIRE_LEN)?;
    Ok(config)
}

/// Keys `rank * records ..` shuffled, random tuple ids.
fn synthetic_table(rank: usize, records: usize, seed: u64) -> TransResult<SourceTable<TuplePayload>> {
    let mut rng = StdRng::seed_from_u64(seed ^ rank as u64);
    let base = (rank * records) as u64;
    let mut keys: Vec<u64> = (base..base + records as u64).collect();
    keys.shuffle(&mut rng);
    let payloads = (0..records)
        .map(|i| TuplePayload {
            tuple_id: rng.gen(),
            timestamp: i as u64,
        })
        .collect();
    SourceTable::new(keys, payloads)
}

fn run_rank(collection: ConnectionCollection, config: &ClusterConfig, cli: &Cli) -> TransResult<RankReport> {
    CANCELLERS
        .lock()
        .unwrap()
        .push(collection.cancel_token().clone());

    let (rank, size) = (collection.rank(), collection.size());
    let table = synthetic_table(rank, cli.records, cli.seed)?;
    let misrouted = AtomicUsize::new(0);
    let matcher = move |peer: usize, key: u64| key % size as u64 == peer as u64;
    let processor = |_src: usize, batch: &StructuredRecordBuffer<TuplePayload>| {
        let wrong = batch
            .keys()
            .into_iter()
            .filter(|k| k % size as u64 != rank as u64)
            .count();
        misrouted.fetch_add(wrong, Ordering::Relaxed);
    };

    let range = 0..table.len();
    let session = match config.exchange.strategy {
        StrategyKind::Write => {
            let strategy = WriteExchange::setup(&collection, &config.exchange)?;
            ExchangeSession::new(&collection, strategy).run(&table, range, &matcher, &processor)?
        }
        StrategyKind::Send => {
            let strategy = SendExchange::setup(&collection, &config.exchange)?;
            ExchangeSession::new(&collection, strategy).run(&table, range, &matcher, &processor)?
        }
    };

    let sent = collection.sum(session.records_sent as u64, 0)?;
    let received = collection.sum(session.records_received as u64, 0)?;
    if let (Some(sent), Some(received)) = (sent, received) {
        if sent != received {
            return Err(TransError::Protocol {
                peer: rank,
                reason: format!("group sent {} records but received {}", sent, received),
            });
        }
    }
    collection.barrier_all()?;

    Ok(RankReport {
        rank,
        session,
        misrouted: misrouted.into_inner(),
        group_moved: received,
    })
}

async fn run_loopback(cli: Arc<Cli>, config: Arc<ClusterConfig>) -> TransResult<Vec<RankReport>> {
    let size = cli.ranks;
    let fabric = Arc::new(LoopbackFabric::new());
    let table = Arc::new(if config.peers.len() >= size {
        StaticAddressTable::from(config.as_ref())
    } else {
        StaticAddressTable::from(&ClusterConfig::local(size, 7471, size)?)
    });

    let handles: Vec<_> = (0..size)
        .map(|rank| {
            let (cli, config, fabric, table) = (cli.clone(), config.clone(), fabric.clone(), table.clone());
            tokio::task::spawn_blocking(move || {
                let membership = StaticMembership::new(rank, size)?;
                let collection = ConnectionCollection::connect(
                    &membership,
                    table.as_ref(),
                    fabric.as_ref(),
                    config.transport.clone(),
                )?;
                run_rank(collection, &config, &cli)
            })
        })
        .collect();

    let mut reports = Vec::with_capacity(size);
    let mut failure = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(report)) => reports.push(report),
            Ok(Err(e)) => {
                error!("rank failed: {}", e);
                cancel_all();
                if failure.as_ref().map_or(true, |f: &TransError| f.is_cancelled()) {
                    failure = Some(e);
                }
            }
            Err(join) => {
                error!("rank panicked: {}", join);
                cancel_all();
                failure.get_or_insert(TransError::Config(format!("rank panicked: {}", join)));
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(reports),
    }
}

#[cfg(feature = "verbs")]
async fn run_verbs(cli: Arc<Cli>, config: Arc<ClusterConfig>) -> TransResult<Vec<RankReport>> {
    use rshuffle::common::membership::EnvMembership;
    use rshuffle::rdma::verbs::VerbsTransport;

    let handle = tokio::task::spawn_blocking(move || {
        let membership = EnvMembership::from_env()?;
        let table = StaticAddressTable::from(config.as_ref());
        let collection =
            ConnectionCollection::connect(&membership, &table, &VerbsTransport, config.transport.clone())?;
        run_rank(collection, &config, &cli)
    });
    match handle.await {
        Ok(result) => result.map(|r| vec![r]),
        Err(join) => Err(TransError::Config(format!("rank panicked: {}", join))),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_log(cli.log.as_ref()) {
        eprintln!("cannot set up logging: {}", e);
        process::exit(1);
    }
    let config = match build_config(&cli) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    if let Err(e) = ctrlc::set_handler(|| {
        warn!("interrupted, cancelling");
        cancel_all();
    }) {
        warn!("cannot install the ctrl-c handler: {}", e);
    }

    let watchdog = Duration::from_secs(cli.timeout_secs);
    let cli = Arc::new(cli);

    #[cfg(feature = "verbs")]
    let run = if std::env::var("RSHUFFLE_RANK").is_ok() || std::env::var("OMPI_COMM_WORLD_RANK").is_ok() {
        tokio::spawn(run_verbs(cli.clone(), config.clone()))
    } else {
        tokio::spawn(run_loopback(cli.clone(), config.clone()))
    };
    #[cfg(not(feature = "verbs"))]
    let run = tokio::spawn(run_loopback(cli.clone(), config.clone()));

    info!(
        "{} strategy, {} records per rank, watchdog {:?}",
        match config.exchange.strategy {
            StrategyKind::Write => "write",
            StrategyKind::Send => "send",
        },
        cli.records,
        watchdog
    );

    let mut run = run;
    let outcome = match tokio::time::timeout(watchdog, &mut run).await {
        Ok(joined) => joined,
        Err(_) => {
            error!("no result after {:?}, cancelling", watchdog);
            cancel_all();
            run.await
        }
    };

    match outcome {
        Ok(Ok(reports)) => {
            let mut misrouted = 0;
            for report in &reports {
                misrouted += report.misrouted;
                match serde_json::to_string_pretty(report) {
                    Ok(json) => println!("{}", json),
                    Err(e) => warn!("cannot encode the report of rank {}: {}", report.rank, e),
                }
            }
            if misrouted > 0 {
                error!("{} records reached the wrong rank", misrouted);
                process::exit(2);
            }
        }
        Ok(Err(e)) => {
            error!("exchange failed: {}", e);
            process::exit(1);
        }
        Err(join) => {
            error!("driver task failed: {}", join);
            process::exit(1);
        }
    }
}
