// ── File change notification ──
//
// File-backed alarm state learns about writes from other processes
// through a watch on the parent directory, filtered to one file name.

use std::ffi::OsString;
use std::path::Path;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{trace, warn};

/// Call `on_change` from notify's thread whenever `path` is created,
/// written, renamed into place or removed. The parent directory must exist.
///
/// The watch lasts as long as the returned watcher.
pub(crate) fn watch_file<F>(path: &Path, on_change: F) -> notify::Result<RecommendedWatcher>
where
    F: Fn() + Send + 'static,
{
    let name: OsString = path
        .file_name()
        .ok_or_else(|| notify::Error::generic("watched path has no file name"))?
        .to_os_string();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| match result {
        Ok(event) => {
            let ours = event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(name.as_os_str()));
            if ours && changes_content(&event.kind) {
                trace!(kind = ?event.kind, "watched file changed");
                on_change();
            }
        }
        Err(e) => warn!(error = %e, "file watch error"),
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Opens and closes are reported too; reacting to them would loop on our own reads.
fn changes_content(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Remove(_)
            | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Name(_) | ModifyKind::Any)
    )
}
