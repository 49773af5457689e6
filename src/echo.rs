//! Echo suppression for client-originated writes.
//!
//! When a client writes a file the watcher will report that write back a
//! moment later. The table remembers, per connection, which paths it wrote
//! recently so the broker can skip notifying the writer about its own edit
//! while still notifying everybody else.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::transport::ConnectionId;

#[derive(Debug)]
pub struct SuppressionTable {
    grace: Duration,
    entries: HashMap<ConnectionId, HashMap<PathBuf, Instant>>,
}

impl SuppressionTable {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            entries: HashMap::new(),
        }
    }

    /// Record that `conn` is about to write `path`.
    pub fn mark(&mut self, conn: ConnectionId, path: PathBuf, now: Instant) {
        self.entries
            .entry(conn)
            .or_default()
            .insert(path, now + self.grace);
    }

    pub fn purge_expired(&mut self, now: Instant) {
        self.entries.retain(|_, paths| {
            paths.retain(|_, expires| *expires > now);
            !paths.is_empty()
        });
    }

    /// True when every path of a non-empty batch is suppressed for `conn`.
    ///
    /// A path counts as suppressed when it was marked, or when it is a
    /// directory above a marked path: writing `new/a.txt` creates `new/` and
    /// the watcher reports both. A batch that also touches anything else is
    /// delivered, so a third-party change is never hidden behind the
    /// client's own write.
    pub fn is_suppressed<'a, I>(&self, conn: &ConnectionId, mut paths: I, now: Instant) -> bool
    where
        I: Iterator<Item = &'a Path>,
    {
        let Some(marked) = self.entries.get(conn) else {
            return false;
        };
        let mut any = false;
        let all = paths.all(|path| {
            any = true;
            marked
                .iter()
                .any(|(mark, expires)| *expires > now && mark.starts_with(path))
        });
        any && all
    }

    /// Drop every entry for the given paths, across connections. Called once
    /// a batch mentioning them has been dispatched.
    pub fn consume<'a, I>(&mut self, paths: I)
    where
        I: Iterator<Item = &'a Path> + Clone,
    {
        self.entries.retain(|_, marked| {
            for path in paths.clone() {
                marked.remove(path);
            }
            !marked.is_empty()
        });
    }

    pub fn forget(&mut self, conn: &ConnectionId) {
        self.entries.remove(conn);
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(list: &[&str]) -> Vec<PathBuf> {
        list.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn writer_is_suppressed_others_are_not() {
        let now = Instant::now();
        let mut table = SuppressionTable::new(Duration::from_secs(2));
        let writer = ConnectionId::new();
        let other = ConnectionId::new();
        table.mark(writer, PathBuf::from("/ws/a.txt"), now);

        let batch = paths(&["/ws/a.txt"]);
        assert!(table.is_suppressed(&writer, batch.iter().map(PathBuf::as_path), now));
        assert!(!table.is_suppressed(&other, batch.iter().map(PathBuf::as_path), now));
    }

    #[test]
    fn directories_created_for_a_write_are_suppressed() {
        let now = Instant::now();
        let mut table = SuppressionTable::new(Duration::from_secs(2));
        let writer = ConnectionId::new();
        let other = ConnectionId::new();
        table.mark(writer, PathBuf::from("/ws/new/deeper/notes.txt"), now);

        let batch = paths(&["/ws/new", "/ws/new/deeper", "/ws/new/deeper/notes.txt"]);
        assert!(table.is_suppressed(&writer, batch.iter().map(PathBuf::as_path), now));
        assert!(!table.is_suppressed(&other, batch.iter().map(PathBuf::as_path), now));

        // The directory alone, reported ahead of the file, is still the writer's.
        let dir_only = paths(&["/ws/new"]);
        assert!(table.is_suppressed(&writer, dir_only.iter().map(PathBuf::as_path), now));
    }

    #[test]
    fn sibling_and_prefix_names_are_not_ancestors() {
        let now = Instant::now();
        let mut table = SuppressionTable::new(Duration::from_secs(2));
        let writer = ConnectionId::new();
        table.mark(writer, PathBuf::from("/ws/new/notes.txt"), now);

        let sibling = paths(&["/ws/new/other.txt"]);
        assert!(!table.is_suppressed(&writer, sibling.iter().map(PathBuf::as_path), now));
        let prefix = paths(&["/ws/ne"]);
        assert!(!table.is_suppressed(&writer, prefix.iter().map(PathBuf::as_path), now));
    }

    #[test]
    fn mixed_batch_is_not_suppressed() {
        let now = Instant::now();
        let mut table = SuppressionTable::new(Duration::from_secs(2));
        let writer = ConnectionId::new();
        table.mark(writer, PathBuf::from("/ws/a.txt"), now);

        let batch = paths(&["/ws/a.txt", "/ws/b.txt"]);
        assert!(!table.is_suppressed(&writer, batch.iter().map(PathBuf::as_path), now));
    }

    #[test]
    fn empty_batch_is_never_suppressed() {
        let now = Instant::now();
        let mut table = SuppressionTable::new(Duration::from_secs(2));
        let writer = ConnectionId::new();
        table.mark(writer, PathBuf::from("/ws/a.txt"), now);
        assert!(!table.is_suppressed(&writer, std::iter::empty(), now));
    }

    #[test]
    fn entries_expire_after_grace() {
        let now = Instant::now();
        let mut table = SuppressionTable::new(Duration::from_millis(100));
        let writer = ConnectionId::new();
        table.mark(writer, PathBuf::from("/ws/a.txt"), now);

        let later = now + Duration::from_millis(150);
        let batch = paths(&["/ws/a.txt"]);
        assert!(!table.is_suppressed(&writer, batch.iter().map(PathBuf::as_path), later));

        table.purge_expired(later);
        assert!(table.is_empty());
    }

    #[test]
    fn consume_clears_paths_for_all_connections() {
        let now = Instant::now();
        let mut table = SuppressionTable::new(Duration::from_secs(2));
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        table.mark(a, PathBuf::from("/ws/x"), now);
        table.mark(b, PathBuf::from("/ws/x"), now);
        table.mark(b, PathBuf::from("/ws/y"), now);

        let batch = paths(&["/ws/x"]);
        table.consume(batch.iter().map(PathBuf::as_path));

        assert_eq!(table.len(), 1);
        let y = paths(&["/ws/y"]);
        assert!(table.is_suppressed(&b, y.iter().map(PathBuf::as_path), now));
    }

    #[test]
    fn forget_drops_a_connection() {
        let now = Instant::now();
        let mut table = SuppressionTable::new(Duration::from_secs(2));
        let a = ConnectionId::new();
        table.mark(a, PathBuf::from("/ws/x"), now);
        table.forget(&a);
        assert!(table.is_empty());
    }
}
