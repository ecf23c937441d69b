//! sync-daemon: Keeps a diagram document and a mirror `.drawio` file in sync.
//!
//! The mirror plays the live editing session: open it in a diagram editor and
//! every save shows up in the document in the document's own format (plain
//! diagram XML, an SVG with the diagram embedded, or a generated script).

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use sync_daemon::watcher::{FileEvent, FileEventKind, FileWatcher, canonical};
use sync_daemon::{FileDocument, MirrorSession};

use sync_core::{DiagramSession, DocumentUri, SessionEvent, SyncConfig, SyncEvent, SyncRegistry};

#[derive(Parser, Debug)]
#[command(name = "sync-daemon")]
#[command(about = "Diagram document <-> editor sync daemon")]
struct Args {
    /// Path to the diagram document (.drawio, .dio, .svg, .py)
    #[arg(short, long)]
    document: PathBuf,

    /// Path to the mirror file the diagram editor works on
    #[arg(short, long)]
    mirror: PathBuf,

    /// Script converter command, reading diagram XML on stdin and the script
    /// to update from the file named by DIAGRAM_SYNC_SCRIPT
    #[arg(long)]
    converter: Option<String>,

    /// Seconds a converter run may take before it is killed
    #[arg(long, default_value_t = 30)]
    converter_timeout: u64,

    /// URI scheme of the document (read-only schemes are never written)
    #[arg(long, default_value = "file")]
    scheme: String,

    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print diagnostics as JSON lines on stdout
    #[arg(long)]
    json_events: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

/// Daemon state holding all components.
struct Daemon {
    document: Arc<FileDocument>,
    session: Arc<MirrorSession>,
    document_path: PathBuf,
    mirror_path: PathBuf,
}

impl Daemon {
    /// Handle a file change event from the watcher.
    async fn on_file_changed(&self, event: FileEvent) {
        if event.kind == FileEventKind::Deleted {
            warn!("{} was deleted; waiting for it to come back", event.path.display());
            return;
        }

        if event.path == self.document_path {
            match self.document.reload_from_disk().await {
                Ok(true) => debug!("Document changed on disk"),
                Ok(false) => debug!("Document unchanged (own write)"),
                Err(e) => error!("Failed to reload document: {}", e),
            }
        } else if event.path == self.mirror_path {
            match self.session.reload_from_disk().await {
                Ok(true) => debug!("Mirror changed on disk"),
                Ok(false) => debug!("Mirror unchanged (own write)"),
                Err(e) => error!("Failed to reload mirror: {}", e),
            }
        }
    }
}

/// Log a diagnostic event, or print it as a JSON line.
fn report(event: &SyncEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => error!("Failed to serialize event: {}", e),
        }
        return;
    }

    match event {
        SyncEvent::Propagated { uri, direction } => info!("{}: synced {}", uri, direction),
        SyncEvent::Unchanged { uri, direction } => debug!("{}: no change ({})", uri, direction),
        SyncEvent::ConversionFailed { uri, message } => {
            warn!("{}: script conversion failed, file left as is: {}", uri, message)
        }
        SyncEvent::PropagationFailed {
            uri,
            direction,
            message,
        } => error!("{}: sync {} failed: {}", uri, direction, message),
    }
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let config = match path {
        Some(path) => SyncConfig::from_file(path)?,
        None => SyncConfig::default(),
    };
    Ok(config.apply_env())
}

// Sync handlers run as one event loop, so a single thread is all they need
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,sync_daemon=debug,sync_core=debug"
    } else {
        "info,sync_daemon=info,sync_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // Logs go to stderr so JSON events own stdout
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting sync-daemon");
    info!("Document: {:?}", args.document);
    info!("Mirror: {:?}", args.mirror);

    let config = load_config(args.config.as_deref())?;
    debug!("Config: {:?}", config);

    let document_path = canonical(&args.document);
    let mirror_path = canonical(&args.mirror);

    let uri = DocumentUri::new(args.scheme.as_str(), document_path.to_string_lossy());
    let document = Arc::new(
        FileDocument::open_as(&document_path, uri)
            .await
            .with_context(|| format!("Failed to open {}", document_path.display()))?,
    );

    let converter: Vec<String> = args
        .converter
        .as_deref()
        .map(|c| c.split_whitespace().map(String::from).collect())
        .unwrap_or_default();
    let session = Arc::new(
        MirrorSession::new(&mirror_path)
            .with_converter(converter)
            .with_converter_timeout(Duration::from_secs(args.converter_timeout)),
    );

    let registry = SyncRegistry::new(config);
    let json_events = args.json_events;
    let _diagnostics = registry
        .diagnostics()
        .subscribe(move |event: SyncEvent| report(&event, json_events));

    let id = registry.open(document.clone(), session.clone())?;

    // Boot the session with the document's content
    session.events().emit(SessionEvent::Initialized);

    let mut watcher = FileWatcher::new(&[document_path.clone(), mirror_path.clone()])?;
    info!("File watcher started");

    let daemon = Daemon {
        document,
        session,
        document_path,
        mirror_path,
    };

    info!("Daemon running (session {}). Press Ctrl+C to stop.", id);

    // Main event loop
    loop {
        tokio::select! {
            // Handle file watcher events
            Some(event) = watcher.event_rx().recv() => {
                daemon.on_file_changed(event).await;
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    registry.close_all();
    daemon.session.close();
    Ok(())
}
