//! Host catalog and layered filesystem composition.
//!
//! A host's visible filesystem is the base snapshot from the catalog, then
//! each active Operation's delta in activation order, with the player's own
//! deletions interleaved at the point they happened. Nothing here mutates the
//! base snapshot; layers are applied to a scratch map on every call.

use std::collections::{BTreeMap, BTreeSet};

use contracts::{FilesystemDelta, FilesystemNode, HostRecord, NodeKind, NodeSpec};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("host `{host_id}` has an invalid path `{path}`")]
    InvalidPath { host_id: String, path: String },
    #[error("ip {ip} is already assigned to host `{host_id}`")]
    DuplicateIp { ip: String, host_id: String },
    #[error("host record has an empty {0}")]
    EmptyField(&'static str),
}

/// Normalizes an absolute path: single leading `/`, no trailing `/`, no
/// empty or `.` segments, `..` folded. Relative input yields `None`.
pub fn normalize_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let mut segments: Vec<&str> = Vec::new();
    for segment in trimmed.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                let _ = segments.pop();
            }
            other => segments.push(other),
        }
    }
    Some(format!("/{}", segments.join("/")))
}

fn subtree_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostCatalog {
    hosts: BTreeMap<String, HostRecord>,
    host_by_ip: BTreeMap<String, String>,
}

impl HostCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a host. Base paths are stored normalized.
    pub fn register(&mut self, record: HostRecord) -> Result<(), CatalogError> {
        if record.host_id.trim().is_empty() {
            return Err(CatalogError::EmptyField("host_id"));
        }
        if record.ip.trim().is_empty() {
            return Err(CatalogError::EmptyField("ip"));
        }
        if let Some(owner) = self.host_by_ip.get(&record.ip) {
            if owner != &record.host_id {
                return Err(CatalogError::DuplicateIp {
                    ip: record.ip.clone(),
                    host_id: owner.clone(),
                });
            }
        }

        let mut filesystem = BTreeMap::new();
        for (path, node) in record.filesystem {
            let normalized = normalize_path(&path).ok_or_else(|| CatalogError::InvalidPath {
                host_id: record.host_id.clone(),
                path: path.clone(),
            })?;
            filesystem.insert(normalized, node);
        }

        if let Some(previous) = self.hosts.get(&record.host_id) {
            self.host_by_ip.remove(&previous.ip);
        }
        self.host_by_ip
            .insert(record.ip.clone(), record.host_id.clone());
        self.hosts.insert(
            record.host_id.clone(),
            HostRecord {
                filesystem,
                ..record
            },
        );
        Ok(())
    }

    pub fn host(&self, host_id: &str) -> Option<&HostRecord> {
        self.hosts.get(host_id)
    }

    pub fn host_by_ip(&self, ip: &str) -> Option<&HostRecord> {
        self.host_by_ip
            .get(ip.trim())
            .and_then(|host_id| self.hosts.get(host_id))
    }

    pub fn contains(&self, host_id: &str) -> bool {
        self.hosts.contains_key(host_id)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &HostRecord> {
        self.hosts.values()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Flattened result of applying every layer for one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposedView {
    known_host: bool,
    entries: BTreeMap<String, NodeSpec>,
}

impl ComposedView {
    /// `overlays` carry their activation sequence and must be in ascending
    /// order. Each tombstone is marked with the last sequence activated before
    /// the deletion, so it hides every layer up to that mark and nothing
    /// activated after it.
    pub fn compose<'a>(
        base: Option<&HostRecord>,
        overlays: impl IntoIterator<Item = (u64, &'a FilesystemDelta)>,
        tombstones: Option<&BTreeMap<String, u64>>,
    ) -> Self {
        let mut view = Self {
            known_host: base.is_some(),
            entries: base
                .map(|host| host.filesystem.clone())
                .unwrap_or_default(),
        };

        let mut pending = tombstones
            .map(|tombstones| {
                let mut marked = tombstones
                    .iter()
                    .map(|(path, mark)| (*mark, path.as_str()))
                    .collect::<Vec<_>>();
                marked.sort();
                marked
            })
            .unwrap_or_default()
            .into_iter()
            .peekable();

        for (seq, delta) in overlays {
            while let Some((_, path)) = pending.next_if(|(mark, _)| *mark < seq) {
                view.remove_subtree(path);
            }
            view.known_host = true;
            for removed in &delta.removed {
                if let Some(path) = normalize_path(removed) {
                    view.remove_subtree(&path);
                }
            }
            for (raw_path, node) in &delta.nodes {
                if let Some(path) = normalize_path(raw_path) {
                    if node.kind == NodeKind::File {
                        view.remove_subtree(&path);
                    }
                    view.entries.insert(path, node.clone());
                }
            }
        }

        for (_, path) in pending {
            view.remove_subtree(path);
        }

        view
    }

    fn remove_subtree(&mut self, path: &str) {
        if path == "/" {
            self.entries.clear();
            return;
        }
        self.entries.remove(path);
        let prefix = subtree_prefix(path);
        let doomed = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in doomed {
            self.entries.remove(&key);
        }
    }

    fn has_descendants(&self, path: &str) -> bool {
        let prefix = subtree_prefix(path);
        self.entries
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(key, _)| key.starts_with(&prefix))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_some()
    }

    /// Immediate child names, sorted. Intermediate directories that are only
    /// implied by deeper paths are included.
    pub fn children(&self, path: &str) -> Vec<String> {
        let prefix = subtree_prefix(path);
        let mut names = BTreeSet::new();
        for (key, _) in self
            .entries
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
        {
            if let Some(name) = key[prefix.len()..].split('/').next() {
                if !name.is_empty() {
                    names.insert(name.to_string());
                }
            }
        }
        names.into_iter().collect()
    }

    pub fn resolve(&self, raw_path: &str) -> Option<FilesystemNode> {
        let path = normalize_path(raw_path)?;

        let kind = match self.entries.get(&path) {
            Some(node) => node.kind,
            None if path == "/" && self.known_host => NodeKind::Dir,
            None if self.has_descendants(&path) => NodeKind::Dir,
            None => return None,
        };

        match kind {
            NodeKind::Dir => Some(FilesystemNode {
                kind,
                children: Some(self.children(&path)),
                content: None,
                path,
            }),
            NodeKind::File => Some(FilesystemNode {
                kind,
                content: self.entries.get(&path).and_then(|node| node.content.clone()),
                children: None,
                path,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostRecord {
        HostRecord {
            host_id: "relay".to_string(),
            ip: "10.0.0.5".to_string(),
            hostname: Some("relay.corp".to_string()),
            filesystem: BTreeMap::from([
                ("/etc/motd".to_string(), NodeSpec::file("welcome")),
                ("/var/log/auth.log".to_string(), NodeSpec::file("sshd: ok")),
            ]),
        }
    }

    #[test]
    fn normalize_folds_separators_and_dots() {
        assert_eq!(normalize_path("/var//log/./x/../auth.log/").as_deref(), Some("/var/log/auth.log"));
        assert_eq!(normalize_path("/").as_deref(), Some("/"));
        assert_eq!(normalize_path("relative/path"), None);
    }

    #[test]
    fn implicit_directories_resolve_with_children() {
        let base = host();
        let view = ComposedView::compose(Some(&base), [], None);
        let var = view.resolve("/var").expect("implied dir");
        assert_eq!(var.kind, NodeKind::Dir);
        assert_eq!(var.children, Some(vec!["log".to_string()]));
        let root = view.resolve("/").expect("root");
        assert_eq!(root.children, Some(vec!["etc".to_string(), "var".to_string()]));
    }

    #[test]
    fn later_overlay_wins_and_removed_hides_base() {
        let base = host();
        let first = FilesystemDelta {
            nodes: BTreeMap::from([("/etc/motd".to_string(), NodeSpec::file("first"))]),
            removed: BTreeSet::new(),
        };
        let second = FilesystemDelta {
            nodes: BTreeMap::from([("/etc/motd".to_string(), NodeSpec::file("second"))]),
            removed: BTreeSet::from(["/var".to_string()]),
        };
        let view = ComposedView::compose(Some(&base), [(1, &first), (2, &second)], None);
        let motd = view.resolve("/etc/motd").expect("motd");
        assert_eq!(motd.content.as_deref(), Some("second"));
        assert!(view.resolve("/var/log/auth.log").is_none());
        assert!(view.resolve("/var").is_none());
    }

    #[test]
    fn deletion_hides_overlays_activated_before_it() {
        let base = host();
        let overlay = FilesystemDelta {
            nodes: BTreeMap::from([("/var/log/auth.log".to_string(), NodeSpec::file("forged"))]),
            removed: BTreeSet::new(),
        };
        let tombstones = BTreeMap::from([("/var/log/auth.log".to_string(), 1)]);
        let view = ComposedView::compose(Some(&base), [(1, &overlay)], Some(&tombstones));
        assert!(!view.exists("/var/log/auth.log"));
        assert!(view.exists("/etc/motd"));
    }

    #[test]
    fn overlay_activated_after_a_deletion_restores_the_path() {
        let base = host();
        let planted = FilesystemDelta {
            nodes: BTreeMap::from([("/var/log/auth.log".to_string(), NodeSpec::file("planted"))]),
            removed: BTreeSet::new(),
        };
        let tombstones = BTreeMap::from([
            ("/var/log/auth.log".to_string(), 1),
            ("/etc/motd".to_string(), 3),
        ]);
        let view = ComposedView::compose(Some(&base), [(2, &planted)], Some(&tombstones));
        let node = view.resolve("/var/log/auth.log").expect("planted after the wipe");
        assert_eq!(node.content.as_deref(), Some("planted"));
        assert!(!view.exists("/etc/motd"));
    }

    #[test]
    fn unknown_host_without_overlays_has_no_root() {
        let view = ComposedView::compose(None, [], None);
        assert!(view.resolve("/").is_none());
    }

    #[test]
    fn catalog_rejects_shared_ip() {
        let mut catalog = HostCatalog::new();
        catalog.register(host()).expect("first host");
        let mut clash = host();
        clash.host_id = "mirror".to_string();
        let err = catalog.register(clash).expect_err("ip in use");
        assert!(matches!(err, CatalogError::DuplicateIp { .. }));
        assert_eq!(catalog.host_by_ip("10.0.0.5").map(|h| h.host_id.as_str()), Some("relay"));
    }
}
