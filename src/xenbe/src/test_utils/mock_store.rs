// Copyright 2025 The xenbe Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;

use utils::async_context::AsyncContext;
use utils::lock;

use crate::xen::{DomId, WatchCallback, XenStore, XenStoreError};

fn normalize(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" => "/",
        path => path,
    }
}

fn is_below(path: &str, parent: &str) -> bool {
    path == parent
        || (path.starts_with(parent)
            && (parent.ends_with('/') || path[parent.len()..].starts_with('/')))
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, String>,
    watches: HashMap<String, WatchCallback>,
    history: Vec<(String, String)>,
    read_failures: HashSet<String>,
}

/// In-memory xenstore. Watches fire on a dedicated dispatch thread, like the daemon's watch
/// events.
pub struct MockXenStore {
    tree: Mutex<Tree>,
    dispatch: AsyncContext,
}

impl fmt::Debug for MockXenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tree = lock(&self.tree);
        f.debug_struct("MockXenStore")
            .field("nodes", &tree.nodes)
            .field("watches", &tree.watches.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for MockXenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockXenStore {
    pub fn new() -> Self {
        MockXenStore {
            tree: Mutex::new(Tree::default()),
            dispatch: AsyncContext::new("xs_watch").unwrap(),
        }
    }

    /// Value at `path`, if any.
    pub fn read(&self, path: &str) -> Option<String> {
        lock(&self.tree).nodes.get(normalize(path)).cloned()
    }

    /// Every value written to `path`, oldest first.
    pub fn write_history(&self, path: &str) -> Vec<String> {
        let path = normalize(path);
        lock(&self.tree)
            .history
            .iter()
            .filter(|(written, _)| written == path)
            .map(|(_, value)| value.clone())
            .collect()
    }

    pub fn has_watch(&self, path: &str) -> bool {
        lock(&self.tree).watches.contains_key(normalize(path))
    }

    pub fn watch_count(&self) -> usize {
        lock(&self.tree).watches.len()
    }

    /// Makes reads of `path` fail until reset.
    pub fn fail_reads(&self, path: &str, fail: bool) {
        let path = normalize(path).to_string();
        let mut tree = lock(&self.tree);

        if fail {
            tree.read_failures.insert(path);
        } else {
            tree.read_failures.remove(&path);
        }
    }

    /// Waits until the watch callbacks queued so far have run.
    pub fn flush_watches(&self) {
        let (sender, receiver) = std::sync::mpsc::channel();
        if self
            .dispatch
            .submit(move || {
                let _ = sender.send(());
            })
            .is_ok()
        {
            let _ = receiver.recv();
        }
    }

    fn fire(&self, tree: &Tree, path: &str, removed: bool) {
        for (watch, callback) in &tree.watches {
            if is_below(path, watch) || (removed && is_below(watch, path)) {
                let callback = callback.clone();
                let watch = watch.clone();
                // Nothing to deliver once the dispatcher is gone.
                let _ = self.dispatch.submit(move || callback(&watch));
            }
        }
    }
}

impl XenStore for MockXenStore {
    fn domain_path(&self, dom_id: DomId) -> Result<String, XenStoreError> {
        Ok(format!("/local/domain/{dom_id}"))
    }

    fn read_string(&self, path: &str) -> Result<String, XenStoreError> {
        let path = normalize(path);
        let tree = lock(&self.tree);

        if tree.read_failures.contains(path) {
            return Err(XenStoreError::Read(path.to_string()));
        }

        tree.nodes
            .get(path)
            .cloned()
            .ok_or_else(|| XenStoreError::Read(path.to_string()))
    }

    fn write_string(&self, path: &str, value: &str) -> Result<(), XenStoreError> {
        let path = normalize(path);
        let mut tree = lock(&self.tree);

        for (i, _) in path.match_indices('/').filter(|(i, _)| *i > 0) {
            tree.nodes.entry(path[..i].to_string()).or_default();
        }

        tree.nodes.insert(path.to_string(), value.to_string());
        tree.history.push((path.to_string(), value.to_string()));
        self.fire(&tree, path, false);

        Ok(())
    }

    fn read_directory(&self, path: &str) -> Result<Vec<String>, XenStoreError> {
        let path = normalize(path);
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let tree = lock(&self.tree);

        if tree.read_failures.contains(path) {
            return Err(XenStoreError::Read(path.to_string()));
        }

        Ok(tree
            .nodes
            .range(prefix.clone()..)
            .take_while(|(node, _)| node.starts_with(&prefix))
            .map(|(node, _)| &node[prefix.len()..])
            .filter(|name| !name.contains('/'))
            .map(str::to_string)
            .collect())
    }

    fn exists(&self, path: &str) -> bool {
        lock(&self.tree).nodes.contains_key(normalize(path))
    }

    fn remove(&self, path: &str) -> Result<(), XenStoreError> {
        let path = normalize(path);
        let mut tree = lock(&self.tree);

        if !tree.nodes.contains_key(path) {
            return Err(XenStoreError::Remove(path.to_string()));
        }

        tree.nodes.retain(|node, _| !is_below(node, path));
        self.fire(&tree, path, true);

        Ok(())
    }

    fn set_watch(&self, path: &str, callback: WatchCallback) -> Result<(), XenStoreError> {
        let path = normalize(path).to_string();
        lock(&self.tree)
            .watches
            .insert(path.clone(), callback.clone());

        let watch = path.clone();
        self.dispatch
            .submit(move || callback(&watch))
            .map_err(|_| XenStoreError::SetWatch(path))
    }

    fn clear_watch(&self, path: &str) -> Result<(), XenStoreError> {
        let path = normalize(path);

        lock(&self.tree)
            .watches
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| XenStoreError::ClearWatch(path.to_string()))
    }
}
