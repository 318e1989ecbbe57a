//! `watch` command: index a tree, then stream file events until Ctrl-C.

use std::path::Path;

use tokio::sync::broadcast::error::RecvError;

use crate::config::Settings;
use crate::events::FileEvent;
use crate::memory_fs::MemoryFs;
use crate::path::IndexPath;

pub async fn run(dir: &Path, settings: Settings) -> anyhow::Result<()> {
    let root = IndexPath::absolute(dir)?;
    let fs = MemoryFs::builder().settings(settings).build()?;

    fs.watch(&root).await?;
    // Subscribed after the crawl, so its NewFile burst is skipped
    let mut events = fs.subscribe();

    println!(
        "Watching {root} ({} files, {} backend). Press Ctrl-C to stop.",
        fs.count_files(&root),
        fs.backend_name()
    );

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => println!("{}", describe(&event)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("[watcher] dropped {skipped} events");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                crate::log_event!("watcher", "interrupted");
                break;
            }
        }
    }

    fs.unwatch_all();
    Ok(())
}

fn describe(event: &FileEvent) -> String {
    match event {
        FileEvent::NewFile { path } => format!("+ {path}"),
        FileEvent::ChangedFile {
            path,
            old_stats,
            new_stats,
        } => format!("~ {path} ({} -> {} bytes)", old_stats.size, new_stats.size),
        FileEvent::DeletedFile { path } => format!("- {path}"),
    }
}
