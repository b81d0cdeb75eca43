//! chainpipe: Solana block ingestion and enrichment pipeline.
//!
//! Usage:
//! ```bash
//! # Run the pipeline
//! chainpipe run --config config/chainpipe.yaml
//!
//! # Validate a config file (secrets may come from CHAINPIPE_* variables)
//! chainpipe check-config --config config/chainpipe.yaml
//!
//! # Fetch one block and show what the fanout stage would enqueue
//! chainpipe fetch-block --config config/chainpipe.yaml --slot 250000000
//!
//! # Log PumpPortal token launches and migrations
//! chainpipe watch-tokens --config config/chainpipe.yaml
//! ```

use std::env;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::sync::watch;

use chainpipe_core::queue::{OrderedQueue, TaskQueue};
use chainpipe_core::source::{BlockSource, TransactionParser};
use chainpipe_core::store::{StoreQueue, TaskStore};
use chainpipe_core::types::{BlockTask, TransactionBatch};
use chainpipe_http::{
    CredentialPool, EnhancedApiClient, EnhancedApiConfig, HttpClientConfig, RpcBlockClient,
};
use chainpipe_pipeline::config::{PipelineConfig, StoreBackend, WebSocketConfig};
use chainpipe_pipeline::logging::init_tracing;
use chainpipe_pipeline::{
    filter_block, BlockFetcher, BlockWorkerSettings, EnrichmentPool, EnrichmentSettings,
    SlotIngestor,
};
use chainpipe_storage::{MemoryStore, RedisStore, RedisStoreConfig};
use chainpipe_ws::{Endpoint, NotificationHandler, StreamClient, StreamConfig, WireProtocol};

const DEFAULT_CONFIG: &str = "config/chainpipe.yaml";

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "run" => cmd_run(&args[2..]).await,
        "check-config" => cmd_check_config(&args[2..]),
        "fetch-block" => cmd_fetch_block(&args[2..]).await,
        "watch-tokens" => cmd_watch_tokens(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("chainpipe {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainpipe {}", env!("CARGO_PKG_VERSION"));
    println!("Solana block ingestion and transaction enrichment pipeline\n");
    println!("USAGE:");
    println!("    chainpipe <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    run           Stream slots, fetch blocks, enrich and store transactions");
    println!("    check-config  Load and validate the configuration");
    println!("    fetch-block   Fetch one block and print its qualifying signatures");
    println!("    watch-tokens  Log PumpPortal token launches and migrations");
    println!("    version       Print version");
    println!("    help          Print this help\n");
    println!("FLAGS:");
    println!("    --config <PATH>   Config file  [default: {DEFAULT_CONFIG}]");
    println!("    --slot <SLOT>     Slot to fetch (fetch-block)");
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn load_config(args: &[String]) -> Result<PipelineConfig> {
    let path = parse_flag(args, "--config").unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    PipelineConfig::load(&path).with_context(|| format!("loading {path}"))
}

// ─── Commands ────────────────────────────────────────────────────────────────

fn cmd_check_config(args: &[String]) -> Result<()> {
    let config = load_config(args)?;
    println!("Configuration OK");
    println!("  Network:             {}", config.websocket.network);
    println!("  Store:               {:?}", config.store.backend);
    println!("  Enrichment keys:     {}", config.enrichment.api_keys.len());
    println!("  Sub-batch size:      {}", config.enrichment.sub_batch_size);
    println!("  Block batch size:    {}", config.block_worker.batch_size);
    println!("  Proxy:               {}", config.proxy.effective().unwrap_or_else(|| "off".into()));
    Ok(())
}

async fn cmd_fetch_block(args: &[String]) -> Result<()> {
    let config = load_config(args)?;
    let slot: u64 = parse_flag(args, "--slot")
        .context("--slot is required")?
        .parse()
        .context("--slot must be an unsigned integer")?;

    let source = block_source(&config)?;
    let block = source
        .fetch_block(slot, &config.rpc.block)
        .await
        .with_context(|| format!("fetching slot {slot}"))?;
    let Some(block) = block else {
        println!("Slot {slot}: no block (skipped or not yet available)");
        return Ok(());
    };

    let digest = filter_block(&block);
    println!("Slot {slot}");
    println!("  Transactions: {}", block.transactions.len());
    println!("  Votes:        {}", digest.votes);
    println!("  Failed:       {}", digest.failed);
    println!("  Qualifying:   {}", digest.signatures.len());
    for sig in &digest.signatures {
        println!("    {sig}");
    }
    Ok(())
}

async fn cmd_run(args: &[String]) -> Result<()> {
    let config = load_config(args)?;
    init_tracing(&config.log);

    let store = open_store(&config).await?;
    let (blocks, transactions) = queues(&config, &store);
    let source = block_source(&config)?;
    let credentials = credential_pool(&config)?;

    let fetcher = Arc::new(BlockFetcher::new(
        source,
        Arc::clone(&blocks),
        Arc::clone(&transactions),
        BlockWorkerSettings::from_config(&config.block_worker, config.rpc.block.clone()),
    ));
    let enrichment = Arc::new(EnrichmentPool::new(
        credentials,
        transactions,
        Arc::clone(&store),
        EnrichmentSettings::from_config(&config.enrichment),
    ));

    let stream = StreamClient::with_tungstenite(
        stream_endpoint(&config)?,
        stream_config(&config.websocket),
    );
    stream.on_connect(|| tracing::info!("stream connected"));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let block_task = {
        let fetcher = Arc::clone(&fetcher);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { fetcher.run(rx).await })
    };
    let enrich_task = {
        let enrichment = Arc::clone(&enrichment);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { enrichment.run(rx).await })
    };

    let ingestor = Arc::new(SlotIngestor::new(blocks));
    tokio::select! {
        res = stream.connect_with_retry() => res.context("connecting to the slot stream")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted before the stream connected");
            stream.close().await;
            let _ = shutdown_tx.send(true);
            return Ok(());
        }
    }
    let subscription = stream
        .slot_subscribe(Arc::clone(&ingestor) as Arc<dyn NotificationHandler>)
        .await
        .context("subscribing to slots")?;
    tracing::info!(subscription = %subscription, "pipeline running, waiting for slots");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("shutdown requested");

    stream.close().await;
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(block_task, enrich_task);

    let (fetched, empty, abandoned, enqueued, signatures) = fetcher.stats().snapshot();
    let (batches, ok, dropped, persisted, skipped) = enrichment.stats().snapshot();
    tracing::info!(
        slots_queued = ingestor.accepted(),
        fetched,
        empty,
        abandoned,
        enqueued,
        signatures,
        batches,
        sub_batches_ok = ok,
        sub_batches_dropped = dropped,
        persisted,
        skipped,
        "pipeline stopped"
    );
    Ok(())
}

async fn cmd_watch_tokens(args: &[String]) -> Result<()> {
    let config = load_config(args)?;
    init_tracing(&config.log);

    let endpoint = Endpoint::pump_portal().with_proxy(config.proxy.effective());
    let stream = StreamClient::with_tungstenite(endpoint, stream_config(&config.websocket));
    stream
        .connect_with_retry()
        .await
        .context("connecting to PumpPortal")?;

    let log_event: Arc<dyn NotificationHandler> = Arc::new(|event: Value| async move {
        tracing::info!(event = %event, "pump portal event");
    });
    stream.subscribe_new_token(Arc::clone(&log_event)).await?;
    stream.subscribe_migration(log_event).await?;

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    stream.close().await;
    Ok(())
}

// ─── Wiring ──────────────────────────────────────────────────────────────────

async fn open_store(config: &PipelineConfig) -> Result<Arc<dyn TaskStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("using the in-memory store; pending work is lost on exit");
            let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
            Ok(store)
        }
        StoreBackend::Redis => {
            let redis_config = RedisStoreConfig {
                url: config.store.redis_url.clone(),
                key_prefix: config.store.key_prefix.clone(),
            };
            let store = RedisStore::connect(&redis_config)
                .await
                .context("connecting to redis")?;
            tracing::info!(prefix = %redis_config.key_prefix, "redis store connected");
            let store: Arc<dyn TaskStore> = Arc::new(store);
            Ok(store)
        }
    }
}

fn queues(
    config: &PipelineConfig,
    store: &Arc<dyn TaskStore>,
) -> (Arc<dyn TaskQueue<BlockTask>>, Arc<dyn TaskQueue<TransactionBatch>>) {
    let names = &config.store;
    if names.durable_queues {
        let blocks: Arc<dyn TaskQueue<BlockTask>> =
            Arc::new(StoreQueue::<BlockTask>::new(Arc::clone(store), names.block_queue.clone()));
        let txs: Arc<dyn TaskQueue<TransactionBatch>> = Arc::new(
            StoreQueue::<TransactionBatch>::new(Arc::clone(store), names.tx_queue.clone()),
        );
        (blocks, txs)
    } else {
        let blocks: Arc<dyn TaskQueue<BlockTask>> =
            Arc::new(OrderedQueue::<BlockTask>::new(names.block_queue.clone()));
        let txs: Arc<dyn TaskQueue<TransactionBatch>> =
            Arc::new(OrderedQueue::<TransactionBatch>::new(names.tx_queue.clone()));
        (blocks, txs)
    }
}

fn http_config(config: &PipelineConfig, timeout_ms: u64) -> HttpClientConfig {
    HttpClientConfig {
        proxy: config.proxy.effective(),
        request_timeout: Duration::from_millis(timeout_ms),
    }
}

fn block_source(config: &PipelineConfig) -> Result<Arc<dyn BlockSource>> {
    let client = RpcBlockClient::new(
        &config.rpc.endpoint,
        &config.rpc.api_key,
        &http_config(config, config.rpc.timeout_ms),
    )
    .context("building the block query client")?;
    let source: Arc<dyn BlockSource> = Arc::new(client);
    Ok(source)
}

fn credential_pool(config: &PipelineConfig) -> Result<Arc<CredentialPool<dyn TransactionParser>>> {
    let enrichment = &config.enrichment;
    let base = EnhancedApiConfig {
        endpoint: enrichment.endpoint.clone(),
        http: http_config(config, enrichment.call_timeout_ms),
        requests_per_second: enrichment.requests_per_second,
        ..EnhancedApiConfig::new(String::new())
    };
    let clients: Vec<Arc<dyn TransactionParser>> =
        EnhancedApiClient::for_keys(&base, &enrichment.api_keys)
            .context("building enrichment clients")?
            .into_iter()
            .map(|c| Arc::new(c) as Arc<dyn TransactionParser>)
            .collect();
    if clients.is_empty() {
        bail!("no enrichment credentials configured");
    }
    tracing::info!(credentials = clients.len(), "enrichment clients ready");
    Ok(Arc::new(CredentialPool::new(clients)?))
}

fn stream_endpoint(config: &PipelineConfig) -> Result<Endpoint> {
    let ws = &config.websocket;
    let endpoint = match &ws.url {
        Some(url) => Endpoint::new(url.clone(), WireProtocol::JsonRpc),
        None => Endpoint::helius(&ws.network, &ws.api_key).context("building the stream endpoint")?,
    };
    Ok(endpoint.with_proxy(config.proxy.effective()))
}

fn stream_config(ws: &WebSocketConfig) -> StreamConfig {
    StreamConfig {
        connect_timeout: ws.connect_timeout(),
        heartbeat_interval: ws.heartbeat_interval(),
        reconnect_initial: ws.reconnect_initial(),
        reconnect_max: ws.reconnect_max(),
        handler_concurrency: ws.handler_concurrency.max(1),
        ..StreamConfig::default()
    }
}
