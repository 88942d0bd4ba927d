//! Runs a syncer against an in-memory object store, mirroring one local
//! directory and optionally mounting the remote view back.
//!
//!     cargo run --example mirror_sync -- --local /tmp/demo --mount
//!
//! Edit files under the local root and watch the transfer log; the
//! mounted tree appears under the printed mount point.

use std::sync::Arc;

use clap::Parser;
use osssync::config::{Config, Setting};
use osssync::store::memory::MemoryStore;
use osssync::store::ObjectStore;
use osssync::syncer::Syncer;

#[derive(Parser, Debug)]
#[command(about = "Mirror a local directory into an in-memory object store")]
struct Args {
    /// Local directory to mirror.
    #[arg(long)]
    local: String,
    /// Remote bucket name.
    #[arg(long, default_value = "demo-bucket")]
    bucket: String,
    /// Remote key prefix.
    #[arg(long, default_value = "demo")]
    prefix: String,
    /// Propagate local deletes.
    #[arg(long)]
    delete: bool,
    /// Skip dot-files.
    #[arg(long)]
    ignore_hidden: bool,
    /// Also mount the remote view.
    #[cfg(unix)]
    #[arg(long)]
    mount: bool,
}

#[tokio::main]
async fn main() -> osssync::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let store = Arc::new(MemoryStore::new());
    let factory = {
        let store = Arc::clone(&store);
        move |_setting: &Setting| Arc::clone(&store) as Arc<dyn ObjectStore>
    };
    let syncer = Syncer::new(Arc::new(factory));

    let setting = Setting {
        name: "demo".to_owned(),
        local: args.local.clone(),
        endpoint: "memory://".to_owned(),
        access_key_id: "demo".to_owned(),
        access_key_secret: "demo".to_owned(),
        bucket: args.bucket.clone(),
        prefix: args.prefix.clone(),
        ignore_hidden_files: args.ignore_hidden,
        delete: args.delete,
    };
    syncer.reload(Config { settings: vec![setting.clone()] }).await?;

    let mut status = syncer.events().expect("status stream");
    tokio::spawn(async move {
        while let Some(event) = status.recv().await {
            tracing::info!(handler = %event.handler, status = ?event.status, "sync");
        }
    });

    #[cfg(unix)]
    if args.mount {
        let mountpoint = syncer.mount(setting.clone()).await?;
        tracing::info!(mountpoint = %mountpoint.display(), "remote view mounted");
    }

    tracing::info!(local = %args.local, "mirroring; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    syncer.close().await;
    Ok(())
}
