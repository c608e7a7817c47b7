//! Subcommands and wiring for every federation role.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use invariant_content::ContentLink;
use invariant_durable::DurableMapConfig;
use invariant_files::{FileTree, FileTreeConfig};
use invariant_locator::{HasClient, HasNotifier, HasNotifierConfig, MemoryLocator};
use invariant_registry::discovery::{advertise_and_register, register_name, resolve_name};
use invariant_registry::{
    protocol, Discovery, DiscoveryClient, MemoryDiscovery, MemoryNames, MemorySlots, NameStore,
    PersistentNames, PersistentSlots, SlotStore, SlotsClient,
};
use invariant_replicate::{DistributeClient, ReplicationConfig, ReplicationController};
use invariant_storage::{
    AggregateClient, AggregateClientConfig, BlobStore, BlockFeed, FsStore, MemoryStore,
};

/// Content-addressed blob store federation peer.
#[derive(Parser)]
#[command(name = "invariant", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Flags shared by every peer role.
#[derive(Args, Clone)]
struct CommonArgs {
    /// Port to listen on (0 picks an ephemeral port).
    #[arg(long, env = "PORT", default_value_t = 0)]
    port: u16,

    /// Data directory; enables persistent storage for roles that have it.
    #[arg(long)]
    dir: Option<String>,

    /// Base URL of the discovery registry.
    #[arg(long)]
    discovery: Option<String>,

    /// Host (or URL) to advertise to discovery instead of localhost.
    #[arg(long, default_value = "")]
    advertise: String,

    /// Logical name to register with the name registry.
    #[arg(long)]
    name: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve a content-addressed storage peer.
    Storage {
        #[command(flatten)]
        common: CommonArgs,

        /// Id or name of a distribute service to register with.
        #[arg(long)]
        distribute: Option<String>,

        /// Comma-separated ids of has-v1 consumers to notify.
        #[arg(long)]
        has: Option<String>,

        /// Addresses per has notification batch.
        #[arg(long, default_value_t = 10_000)]
        has_batch_size: usize,

        /// Seconds between has notification flushes.
        #[arg(long, default_value_t = 1)]
        has_duration_secs: u64,
    },
    /// Serve a block location index.
    Finder {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Serve a replication controller.
    Distribute {
        #[command(flatten)]
        common: CommonArgs,

        /// Target number of holders per block.
        #[arg(long, default_value_t = 3)]
        replication: usize,

        /// Seconds between sync passes.
        #[arg(long, default_value_t = 60)]
        sync_secs: u64,
    },
    /// Serve a slot registry.
    Slots {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Serve a name registry.
    Names {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Serve a discovery registry.
    Discovery {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Serve a file tree over aggregate storage.
    Files {
        #[command(flatten)]
        common: CommonArgs,

        /// Comma-separated storage ids, names, or base URLs.
        #[arg(long)]
        storage: Option<String>,

        /// Slot registry id, name, or base URL.
        #[arg(long)]
        slots: Option<String>,

        /// Root block address or slot id.
        #[arg(long, default_value = "")]
        root: String,

        /// Treat the root as a slot id.
        #[arg(long, default_value_t = false)]
        root_is_slot: bool,
    },
}

impl Cli {
    /// Run the selected role to completion.
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Storage {
                common,
                distribute,
                has,
                has_batch_size,
                has_duration_secs,
            } => {
                run_storage(
                    common,
                    distribute,
                    has,
                    has_batch_size,
                    Duration::from_secs(has_duration_secs),
                )
                .await
            }
            Command::Finder { common } => run_finder(common).await,
            Command::Distribute {
                common,
                replication,
                sync_secs,
            } => run_distribute(common, replication, Duration::from_secs(sync_secs)).await,
            Command::Slots { common } => run_slots(common).await,
            Command::Names { common } => run_names(common).await,
            Command::Discovery { common } => run_discovery(common).await,
            Command::Files {
                common,
                storage,
                slots,
                root,
                root_is_slot,
            } => run_files(common, storage, slots, root, root_is_slot).await,
        }
    }
}

fn discovery_client(common: &CommonArgs) -> Option<Arc<dyn Discovery>> {
    common
        .discovery
        .as_ref()
        .map(|url| Arc::new(DiscoveryClient::new(url)) as Arc<dyn Discovery>)
}

async fn bind(port: u16) -> anyhow::Result<(tokio::net::TcpListener, u16)> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to listen on port {port}"))?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

async fn announce(
    discovery: &Option<Arc<dyn Discovery>>,
    common: &CommonArgs,
    id: &str,
    port: u16,
    protocols: &[&str],
) -> anyhow::Result<()> {
    let Some(discovery) = discovery else {
        if common.name.is_some() {
            bail!("--name requires --discovery");
        }
        return Ok(());
    };
    advertise_and_register(discovery.as_ref(), id, &common.advertise, port, protocols)
        .await
        .context("failed to register with discovery")?;
    info!(id, port, "registered with discovery");

    if let Some(name) = &common.name {
        register_name(discovery.as_ref(), name, id, protocols)
            .await
            .context("failed to register logical name")?;
        info!(name = %name, "registered logical name");
    }
    Ok(())
}

/// Resolve an id-or-name-or-URL argument to a base URL.
async fn resolve_base_url(
    discovery: &Option<Arc<dyn Discovery>>,
    raw: &str,
) -> anyhow::Result<String> {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Ok(raw.to_string());
    }
    let Some(discovery) = discovery else {
        return Ok(format!("http://{raw}"));
    };
    let id = match resolve_name(discovery.as_ref(), raw).await {
        Ok(id) => id,
        Err(_) => return Ok(format!("http://{raw}")),
    };
    match discovery.get(&id).await {
        Some(desc) => Ok(desc.address),
        None => Ok(format!("http://{raw}")),
    }
}

async fn run_storage(
    common: CommonArgs,
    distribute: Option<String>,
    has: Option<String>,
    has_batch_size: usize,
    has_duration: Duration,
) -> anyhow::Result<()> {
    let discovery = discovery_client(&common);

    let (store, id, initial, feed): (Arc<dyn BlobStore>, String, Vec<String>, _) =
        match &common.dir {
            Some(dir) => {
                let store = Arc::new(FsStore::open(dir)?);
                let id = store.id().to_string();
                let initial = store.list();
                let feed = store.subscribe();
                info!(dir = %dir, "using filesystem storage");
                (store, id, initial, feed)
            }
            None => {
                let store = Arc::new(MemoryStore::new());
                let id = store.id().to_string();
                let initial = store.list();
                let feed = store.subscribe();
                info!("using in-memory storage");
                (store, id, initial, feed)
            }
        };

    let (listener, port) = bind(common.port).await?;
    announce(&discovery, &common, &id, port, &[protocol::STORAGE]).await?;

    let mut has_clients = Vec::new();
    if let Some(list) = &has {
        let discovery = discovery
            .as_ref()
            .context("--has requires --discovery")?;
        for raw in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match discovery.get(raw).await {
                Some(desc) => has_clients.push(HasClient::new(&desc.address)),
                None => tracing::warn!(id = raw, "has consumer not found in discovery"),
            }
        }
    }

    if let Some(target) = &distribute {
        let discovery = discovery
            .as_ref()
            .context("--distribute requires --discovery")?;
        let dist_id = resolve_name(discovery.as_ref(), target).await?;
        let desc = discovery
            .get(&dist_id)
            .await
            .with_context(|| format!("distribute service {dist_id} not found in discovery"))?;
        DistributeClient::new(&desc.address)
            .register(&id)
            .await
            .context("failed to register with distribute service")?;
        info!(distribute = %dist_id, "registered with distribute service");
        has_clients.push(HasClient::new(&desc.address));
    }

    let _notifier = if has_clients.is_empty() {
        None
    } else {
        Some(HasNotifier::start(
            id.clone(),
            has_clients,
            initial,
            feed,
            HasNotifierConfig {
                batch_size: has_batch_size,
                batch_interval: has_duration,
            },
        ))
    };

    let router = invariant_storage::server::router(id, store, discovery);
    info!(port, "storage peer listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn run_finder(common: CommonArgs) -> anyhow::Result<()> {
    let discovery = discovery_client(&common);

    let id = match &common.dir {
        Some(dir) => invariant_registry::identity::load_or_create(dir)?,
        None => invariant_registry::identity::random_id(),
    };
    let locator = Arc::new(MemoryLocator::new(&id)?);

    let (listener, port) = bind(common.port).await?;
    announce(&discovery, &common, &id, port, &[protocol::FINDER, protocol::HAS]).await?;

    let router = invariant_locator::server::router(locator, discovery);
    info!(port, "finder listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn run_distribute(
    common: CommonArgs,
    replication: usize,
    sync_period: Duration,
) -> anyhow::Result<()> {
    let discovery = discovery_client(&common);

    let controller = Arc::new(ReplicationController::new(
        discovery.clone(),
        ReplicationConfig {
            replication_factor: replication,
            max_failures: 3,
            sync_period,
        },
    ));
    Arc::clone(&controller).start();

    let (listener, port) = bind(common.port).await?;
    let router = invariant_replicate::server::router(Arc::clone(&controller));

    let id = invariant_registry::identity::random_id();
    announce(
        &discovery,
        &common,
        &id,
        port,
        &[protocol::DISTRIBUTE, protocol::HAS],
    )
    .await?;

    info!(port, replication, "replication controller listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn run_slots(common: CommonArgs) -> anyhow::Result<()> {
    let discovery = discovery_client(&common);

    let slots: Arc<dyn SlotStore> = match &common.dir {
        Some(dir) => {
            info!(dir = %dir, "using filesystem slots");
            Arc::new(PersistentSlots::open(dir, DurableMapConfig::default())?)
        }
        None => {
            info!("using in-memory slots");
            Arc::new(MemorySlots::new())
        }
    };
    let id = slots.id();

    let (listener, port) = bind(common.port).await?;
    announce(&discovery, &common, &id, port, &[protocol::SLOTS]).await?;

    let router = invariant_registry::slots_server::router(slots);
    info!(port, "slot registry listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn run_names(common: CommonArgs) -> anyhow::Result<()> {
    let discovery = discovery_client(&common);

    let (names, id): (Arc<dyn NameStore>, String) = match &common.dir {
        Some(dir) => {
            let names = PersistentNames::open(dir, DurableMapConfig::default())?;
            let id = names.id();
            info!(dir = %dir, "using filesystem names");
            (Arc::new(names), id)
        }
        None => {
            info!("using in-memory names");
            (
                Arc::new(MemoryNames::new()),
                invariant_registry::identity::random_id(),
            )
        }
    };

    let (listener, port) = bind(common.port).await?;
    announce(&discovery, &common, &id, port, &[protocol::NAMES]).await?;

    let router = invariant_registry::names_server::router(names);
    info!(port, "name registry listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn run_discovery(common: CommonArgs) -> anyhow::Result<()> {
    let registry = Arc::new(MemoryDiscovery::new());
    let (listener, port) = bind(common.port).await?;
    let router = invariant_registry::discovery_server::router(registry);
    info!(port, "discovery registry listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn run_files(
    common: CommonArgs,
    storage: Option<String>,
    slots: Option<String>,
    root: String,
    root_is_slot: bool,
) -> anyhow::Result<()> {
    let discovery = discovery_client(&common);

    let static_storages: Vec<String> = storage
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let config = AggregateClientConfig {
        num_store_servers: static_storages.len().max(3),
        max_blocks: 1000,
    };
    let aggregate = Arc::new(AggregateClient::new(None, discovery.clone(), config));
    for (i, raw) in static_storages.iter().enumerate() {
        let url = resolve_base_url(&discovery, raw).await?;
        aggregate.add_peer(&format!("static-storage-{i}"), &url);
    }

    let slot_store: Option<Arc<dyn SlotStore>> = match slots {
        Some(raw) => {
            let url = resolve_base_url(&discovery, &raw).await?;
            Some(Arc::new(SlotsClient::new(url)))
        }
        None => None,
    };

    let root_link = ContentLink {
        address: root,
        slot: root_is_slot,
        ..ContentLink::default()
    };

    let tree = FileTree::new(
        aggregate as Arc<dyn BlobStore>,
        slot_store,
        root_link,
        FileTreeConfig::default(),
    )
    .await?;

    let (listener, port) = bind(common.port).await?;
    let router = invariant_files::server::router(tree);
    info!(port, "file tree listening");
    axum::serve(listener, router).await?;
    Ok(())
}
