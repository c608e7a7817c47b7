//! The in-memory node graph and its operations.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use invariant_content::{read_to_vec, write, Compression, ContentLink, Transform, WriterOptions};
use invariant_registry::{RegistryError, SlotStore};
use invariant_storage::BlobStore;

use crate::manifest::{self, Entry, EntryKind, EntryMeta};
use crate::{FileTreeError, Result};

/// The root node id. The root always exists while the engine is live.
pub const ROOT_NODE: u64 = 1;

/// SHA-256 of the empty byte sequence, the etag of content-free nodes.
const EMPTY_DIGEST: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Engine construction options.
#[derive(Debug, Clone)]
pub struct FileTreeConfig {
    /// Period between background non-waiting root syncs.
    pub auto_sync_period: Duration,
    /// Period between slot polls (writable trees only).
    pub slot_poll_period: Duration,
    /// Codec options for file content written through this tree.
    pub writer_options: WriterOptions,
}

impl Default for FileTreeConfig {
    fn default() -> Self {
        Self {
            auto_sync_period: Duration::from_secs(60),
            slot_poll_period: Duration::from_secs(300),
            writer_options: WriterOptions::default(),
        }
    }
}

/// Mutable attributes, also the wire shape for get/set-attributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryAttributes {
    /// Whether the tree accepts mutations. Read-only in responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writable: Option<bool>,
    /// Creation time, seconds since the epoch.
    #[serde(rename = "createTime", skip_serializing_if = "Option::is_none")]
    pub create_time: Option<u64>,
    /// Modification time, seconds since the epoch.
    #[serde(rename = "modifyTime", skip_serializing_if = "Option::is_none")]
    pub modify_time: Option<u64>,
    /// Permission mode string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// File size; files only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// MIME type; files only. `-` clears it.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Summary of a node, served by lookup and info queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node id.
    pub node: u64,
    /// Entry kind.
    pub kind: EntryKind,
    /// Whether the tree accepts mutations.
    pub writable: bool,
    /// Creation time, seconds since the epoch.
    #[serde(rename = "createTime")]
    pub create_time: u64,
    /// Modification time, seconds since the epoch.
    #[serde(rename = "modifyTime")]
    pub modify_time: u64,
    /// Stable content identifier: the expected digest, else the address,
    /// else the digest of nothing.
    pub etag: String,
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    kind: EntryKind,
    parents: BTreeSet<u64>,
    create_time: Option<u64>,
    modify_time: Option<u64>,
    mode: Option<String>,
    size: u64,
    mime_type: String,
    content: ContentLink,
    children: BTreeMap<String, u64>,
    target: String,
    dirty: bool,
    loaded: bool,
}

impl Node {
    fn new(kind: EntryKind) -> Self {
        Self {
            name: String::new(),
            kind,
            parents: BTreeSet::new(),
            create_time: None,
            modify_time: None,
            mode: None,
            size: 0,
            mime_type: String::new(),
            content: ContentLink::default(),
            children: BTreeMap::new(),
            target: String::new(),
            dirty: false,
            loaded: false,
        }
    }
}

struct TreeState {
    nodes: HashMap<u64, Node>,
    next_id: u64,
    last_slot_address: String,
}

struct Inner {
    store: Arc<dyn BlobStore>,
    slots: Option<Arc<dyn SlotStore>>,
    root_link: ContentLink,
    file_options: WriterOptions,
    manifest_options: WriterOptions,
    state: RwLock<TreeState>,
}

/// The file-tree engine. All operations go through one per-engine
/// reader-writer lock; the background timers take the same lock.
pub struct FileTree {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Derive manifest codec options from the root link's transforms, so the
/// root's compression and encryption policy governs the whole tree.
fn options_from_transforms(transforms: &[Transform], base: &WriterOptions) -> WriterOptions {
    let mut opts = base.clone();
    for transform in transforms {
        match transform {
            Transform::Decipher { algorithm, .. } if algorithm == "aes-256-cbc" => {
                opts.encrypt = true;
            }
            Transform::Decompress { algorithm } => {
                opts.compress = match algorithm.as_str() {
                    "inflate" => Compression::Inflate,
                    "gzip" | "unzip" => Compression::Gzip,
                    "brotli" => Compression::Brotli,
                    _ => opts.compress,
                };
            }
            _ => {}
        }
    }
    opts
}

impl FileTree {
    /// Create an engine over `root_link`. A link with an empty address
    /// starts as a loaded, empty root; anything else loads on first touch.
    /// The tree is writable iff a slot registry is present and the root
    /// link is a slot reference.
    pub async fn new(
        store: Arc<dyn BlobStore>,
        slots: Option<Arc<dyn SlotStore>>,
        root_link: ContentLink,
        config: FileTreeConfig,
    ) -> Result<Arc<Self>> {
        let manifest_options =
            options_from_transforms(&root_link.transforms, &config.writer_options);

        let mut root = Node::new(EntryKind::Directory);
        let now = now_secs();
        root.create_time = Some(now);
        root.modify_time = Some(now);
        root.content = root_link.clone();
        if root_link.address.is_empty() {
            root.loaded = true;
        }

        // Seed the CAS baseline with the slot's current value.
        let mut last_slot_address = String::new();
        if root_link.slot {
            if let Some(slots) = &slots {
                match slots.get(&root_link.address).await {
                    Ok(address) => last_slot_address = address,
                    Err(RegistryError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let mut nodes = HashMap::new();
        nodes.insert(ROOT_NODE, root);

        let inner = Arc::new(Inner {
            store,
            slots,
            root_link,
            file_options: config.writer_options.clone(),
            manifest_options,
            state: RwLock::new(TreeState {
                nodes,
                next_id: ROOT_NODE + 1,
                last_slot_address,
            }),
        });

        let tree = Arc::new(Self {
            inner: Arc::clone(&inner),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = tree.tasks.lock().expect("task list lock poisoned");

        let auto_sync = Arc::clone(&inner);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.auto_sync_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = auto_sync.sync_node(ROOT_NODE).await {
                    debug!(error = %e, "auto-sync failed");
                }
            }
        }));

        if inner.is_writable() {
            let poller = Arc::clone(&inner);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(config.slot_poll_period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = poller.poll_slot().await {
                        debug!(error = %e, "slot poll failed");
                    }
                }
            }));
        }

        drop(tasks);
        Ok(tree)
    }

    /// Stop the background timers. Idempotent.
    pub fn close(&self) {
        let mut tasks = self.tasks.lock().expect("task list lock poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// Whether mutations are accepted.
    pub fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    /// Create a file, directory, or symbolic link under `parent`. File and
    /// directory content may come from an existing link or from `data`
    /// (empty when `None`). Returns the new node id.
    pub async fn create_entry(
        &self,
        parent: u64,
        name: &str,
        kind: EntryKind,
        target: &str,
        content: Option<ContentLink>,
        data: Option<&[u8]>,
    ) -> Result<u64> {
        self.inner.require_writable()?;
        manifest::validate_name(name)?;

        // Write file content before taking the lock; the blob store is
        // content-addressed, so an aborted create leaks nothing mutable.
        let link = match (&kind, content) {
            (EntryKind::SymbolicLink, _) => {
                if target.is_empty() {
                    return Err(FileTreeError::BadRequest(
                        "symbolic link target is required".to_string(),
                    ));
                }
                None
            }
            (_, Some(link)) => Some(link),
            (EntryKind::File, None) => Some(
                write(
                    data.unwrap_or_default(),
                    self.inner.store.as_ref(),
                    &self.inner.file_options,
                )
                .await?,
            ),
            (EntryKind::Directory, None) => None,
        };

        let mut state = self.inner.state.write().await;
        self.inner.ensure_loaded(&mut state, parent).await?;

        let parent_node = state
            .nodes
            .get(&parent)
            .ok_or(FileTreeError::UnknownNode(parent))?;
        if parent_node.children.contains_key(name) {
            return Err(FileTreeError::BadRequest(format!(
                "entry {name:?} already exists"
            )));
        }

        let id = state.next_id;
        state.next_id += 1;

        let now = now_secs();
        let mut node = Node::new(kind);
        node.name = name.to_string();
        node.parents.insert(parent);
        node.create_time = Some(now);
        node.modify_time = Some(now);
        match kind {
            EntryKind::File => {
                let link = link.expect("file link prepared above");
                node.size = data.map(|d| d.len() as u64).unwrap_or(0);
                node.content = link;
            }
            EntryKind::Directory => {
                if let Some(link) = link {
                    node.content = link;
                } else {
                    node.loaded = true;
                }
            }
            EntryKind::SymbolicLink => {
                node.target = target.to_string();
            }
        }

        state.nodes.insert(id, node);
        let parent_node = state.nodes.get_mut(&parent).expect("checked above");
        parent_node.children.insert(name.to_string(), id);
        parent_node.modify_time = Some(now);
        mark_dirty(&mut state, parent);

        Ok(id)
    }

    /// Remove the named entry from `parent`. The node is freed when its
    /// last parent link disappears; directory descendants that reach zero
    /// parents are freed with it.
    pub async fn remove(&self, parent: u64, name: &str) -> Result<()> {
        self.inner.require_writable()?;
        let mut state = self.inner.state.write().await;
        self.inner.ensure_loaded(&mut state, parent).await?;

        let parent_node = state
            .nodes
            .get_mut(&parent)
            .ok_or(FileTreeError::UnknownNode(parent))?;
        let child = parent_node
            .children
            .remove(name)
            .ok_or_else(|| FileTreeError::EntryNotFound {
                parent,
                name: name.to_string(),
            })?;
        parent_node.modify_time = Some(now_secs());

        unlink(&mut state, child, parent);
        mark_dirty(&mut state, parent);
        Ok(())
    }

    /// Move an entry, replacing any existing entry at the destination.
    pub async fn rename(
        &self,
        parent: u64,
        old_name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> Result<()> {
        self.inner.require_writable()?;
        manifest::validate_name(new_name)?;
        if parent == new_parent && old_name == new_name {
            return Ok(());
        }

        let mut state = self.inner.state.write().await;
        self.inner.ensure_loaded(&mut state, parent).await?;
        self.inner.ensure_loaded(&mut state, new_parent).await?;

        let child = *state
            .nodes
            .get(&parent)
            .ok_or(FileTreeError::UnknownNode(parent))?
            .children
            .get(old_name)
            .ok_or_else(|| FileTreeError::EntryNotFound {
                parent,
                name: old_name.to_string(),
            })?;

        // A pre-existing destination entry is removed first. If it is the
        // same node arriving under a new name, there is nothing to free.
        if let Some(existing) = state
            .nodes
            .get_mut(&new_parent)
            .ok_or(FileTreeError::UnknownNode(new_parent))?
            .children
            .remove(new_name)
        {
            if existing != child {
                unlink(&mut state, existing, new_parent);
            }
        }

        let now = now_secs();
        if let Some(old_parent_node) = state.nodes.get_mut(&parent) {
            old_parent_node.children.remove(old_name);
            old_parent_node.modify_time = Some(now);
        }
        if let Some(new_parent_node) = state.nodes.get_mut(&new_parent) {
            new_parent_node
                .children
                .insert(new_name.to_string(), child);
            new_parent_node.modify_time = Some(now);
        }
        if let Some(child_node) = state.nodes.get_mut(&child) {
            child_node.name = new_name.to_string();
            child_node.parents.remove(&parent);
            child_node.parents.insert(new_parent);
            child_node.modify_time = Some(now);
        }

        mark_dirty(&mut state, parent);
        mark_dirty(&mut state, new_parent);
        mark_dirty(&mut state, child);
        Ok(())
    }

    /// Hard-link an existing node under another name.
    pub async fn link(&self, parent: u64, name: &str, target: u64) -> Result<()> {
        self.inner.require_writable()?;
        manifest::validate_name(name)?;

        let mut state = self.inner.state.write().await;
        self.inner.ensure_loaded(&mut state, parent).await?;

        if !state.nodes.contains_key(&target) {
            return Err(FileTreeError::UnknownNode(target));
        }
        let parent_node = state
            .nodes
            .get_mut(&parent)
            .ok_or(FileTreeError::UnknownNode(parent))?;
        if parent_node.children.contains_key(name) {
            return Err(FileTreeError::BadRequest(format!(
                "entry {name:?} already exists"
            )));
        }
        parent_node.children.insert(name.to_string(), target);
        parent_node.modify_time = Some(now_secs());
        state
            .nodes
            .get_mut(&target)
            .expect("checked above")
            .parents
            .insert(parent);
        mark_dirty(&mut state, parent);
        Ok(())
    }

    /// Read file bytes (a symbolic link reads as its target path). A zero
    /// `length` means "to end of file".
    pub async fn read_file(&self, id: u64, offset: u64, length: u64) -> Result<Vec<u8>> {
        let link = {
            let state = self.inner.state.read().await;
            let node = state.nodes.get(&id).ok_or(FileTreeError::UnknownNode(id))?;
            match node.kind {
                EntryKind::Directory => return Err(FileTreeError::NotAFile(id)),
                EntryKind::SymbolicLink => return Ok(node.target.clone().into_bytes()),
                EntryKind::File => node.content.clone(),
            }
        };

        let mut data = read_to_vec(
            &link,
            Arc::clone(&self.inner.store),
            self.inner.slots.clone(),
        )
        .await?;

        let start = (offset as usize).min(data.len());
        data.drain(..start);
        if length > 0 {
            data.truncate(length as usize);
        }
        Ok(data)
    }

    /// Write file bytes. `append` adds at the end; otherwise `data`
    /// replaces the range starting at `offset`, keeping any tail beyond
    /// it. The whole file is re-chunked through the codec.
    pub async fn write_file(
        &self,
        id: u64,
        offset: u64,
        append: bool,
        data: &[u8],
    ) -> Result<()> {
        self.inner.require_writable()?;
        let mut state = self.inner.state.write().await;
        let node = state.nodes.get(&id).ok_or(FileTreeError::UnknownNode(id))?;
        if node.kind != EntryKind::File {
            return Err(FileTreeError::NotAFile(id));
        }

        let needs_existing = append || offset > 0;
        let mut content = if needs_existing && !node.content.address.is_empty() {
            read_to_vec(
                &node.content,
                Arc::clone(&self.inner.store),
                self.inner.slots.clone(),
            )
            .await?
        } else {
            Vec::new()
        };

        if append {
            content.extend_from_slice(data);
        } else {
            let offset = offset as usize;
            if content.len() < offset {
                content.resize(offset, 0);
            }
            let end = offset + data.len();
            if content.len() < end {
                content.resize(end, 0);
            }
            content[offset..end].copy_from_slice(data);
        }

        let link = write(
            &content,
            self.inner.store.as_ref(),
            &self.inner.file_options,
        )
        .await?;

        let node = state.nodes.get_mut(&id).expect("checked above");
        node.content = link;
        node.size = content.len() as u64;
        node.modify_time = Some(now_secs());
        mark_dirty(&mut state, id);
        Ok(())
    }

    /// The directory's entries, loading it first if needed.
    pub async fn read_directory(&self, id: u64) -> Result<Vec<Entry>> {
        let mut state = self.inner.state.write().await;
        self.inner.ensure_loaded(&mut state, id).await?;
        let node = state.nodes.get(&id).ok_or(FileTreeError::UnknownNode(id))?;
        let mut entries = Vec::with_capacity(node.children.len());
        for (name, child_id) in &node.children {
            let child = state
                .nodes
                .get(child_id)
                .ok_or(FileTreeError::UnknownNode(*child_id))?;
            entries.push(entry_for(name, child));
        }
        Ok(entries)
    }

    /// Look up a named child and describe it.
    pub async fn lookup(&self, parent: u64, name: &str) -> Result<NodeInfo> {
        let mut state = self.inner.state.write().await;
        self.inner.ensure_loaded(&mut state, parent).await?;
        let parent_node = state
            .nodes
            .get(&parent)
            .ok_or(FileTreeError::UnknownNode(parent))?;
        let child = *parent_node
            .children
            .get(name)
            .ok_or_else(|| FileTreeError::EntryNotFound {
                parent,
                name: name.to_string(),
            })?;
        let node = state
            .nodes
            .get(&child)
            .ok_or(FileTreeError::UnknownNode(child))?;
        Ok(self.inner.info_for(child, node))
    }

    /// Describe a node.
    pub async fn get_info(&self, id: u64) -> Result<NodeInfo> {
        let state = self.inner.state.read().await;
        let node = state.nodes.get(&id).ok_or(FileTreeError::UnknownNode(id))?;
        Ok(self.inner.info_for(id, node))
    }

    /// The node's current attributes.
    pub async fn get_attributes(&self, id: u64) -> Result<EntryAttributes> {
        let state = self.inner.state.read().await;
        let node = state.nodes.get(&id).ok_or(FileTreeError::UnknownNode(id))?;
        Ok(self.inner.attributes_for(node))
    }

    /// Update attributes; file-only fields are ignored on other kinds. A
    /// `-` MIME type clears the stored one.
    pub async fn set_attributes(&self, id: u64, attrs: EntryAttributes) -> Result<EntryAttributes> {
        self.inner.require_writable()?;
        if let Some(mode) = &attrs.mode {
            manifest::validate_mode(mode)?;
        }
        let mut state = self.inner.state.write().await;
        let node = state.nodes.get_mut(&id).ok_or(FileTreeError::UnknownNode(id))?;

        if let Some(create_time) = attrs.create_time {
            node.create_time = Some(create_time);
        }
        if let Some(modify_time) = attrs.modify_time {
            node.modify_time = Some(modify_time);
        }
        if let Some(mode) = attrs.mode {
            node.mode = Some(mode);
        }
        if node.kind == EntryKind::File {
            if let Some(size) = attrs.size {
                node.size = size;
            }
            if let Some(mime_type) = attrs.mime_type {
                node.mime_type = if mime_type == "-" {
                    String::new()
                } else {
                    mime_type
                };
            }
        }

        mark_dirty(&mut state, id);
        let node = state.nodes.get(&id).expect("checked above");
        Ok(self.inner.attributes_for(node))
    }

    /// The node's content link (files and directories).
    pub async fn get_content(&self, id: u64) -> Result<ContentLink> {
        let state = self.inner.state.read().await;
        let node = state.nodes.get(&id).ok_or(FileTreeError::UnknownNode(id))?;
        if node.kind == EntryKind::SymbolicLink {
            return Err(FileTreeError::BadRequest(
                "symbolic links carry no content link".to_string(),
            ));
        }
        Ok(node.content.clone())
    }

    /// Serialize dirty directories under `id` (post-order) and, when `id`
    /// is the root of a writable tree, publish the new root address via
    /// the slot CAS. `wait = false` runs in the background.
    pub async fn sync(&self, id: u64, wait: bool) -> Result<()> {
        if wait {
            return self.inner.sync_node(id).await;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = inner.sync_node(id).await {
                warn!(node = id, error = %e, "background sync failed");
            }
        });
        Ok(())
    }

    #[cfg(test)]
    async fn is_dirty(&self, id: u64) -> bool {
        let state = self.inner.state.read().await;
        state.nodes.get(&id).map(|n| n.dirty).unwrap_or(false)
    }

    #[cfg(test)]
    async fn node_exists(&self, id: u64) -> bool {
        let state = self.inner.state.read().await;
        state.nodes.contains_key(&id)
    }
}

impl Drop for FileTree {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn is_writable(&self) -> bool {
        self.slots.is_some() && self.root_link.slot
    }

    fn require_writable(&self) -> Result<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(FileTreeError::ReadOnly)
        }
    }

    fn info_for(&self, id: u64, node: &Node) -> NodeInfo {
        let etag = if !node.content.expected.is_empty() {
            node.content.expected.clone()
        } else if !node.content.address.is_empty() {
            node.content.address.clone()
        } else {
            EMPTY_DIGEST.to_string()
        };
        NodeInfo {
            node: id,
            kind: node.kind,
            writable: self.is_writable(),
            create_time: node.create_time.unwrap_or(0),
            modify_time: node.modify_time.unwrap_or(0),
            etag,
        }
    }

    fn attributes_for(&self, node: &Node) -> EntryAttributes {
        let mut attrs = EntryAttributes {
            writable: Some(self.is_writable()),
            create_time: node.create_time,
            modify_time: node.modify_time,
            mode: node.mode.clone(),
            size: None,
            mime_type: None,
        };
        if node.kind == EntryKind::File {
            attrs.size = Some(node.size);
            attrs.mime_type = Some(node.mime_type.clone());
        }
        attrs
    }

    /// Load a directory's children from its manifest. Idempotent. An empty
    /// address (or an empty/missing slot for the root) is a loaded, empty
    /// directory.
    async fn ensure_loaded(&self, state: &mut TreeState, id: u64) -> Result<()> {
        let node = state.nodes.get(&id).ok_or(FileTreeError::UnknownNode(id))?;
        if node.kind != EntryKind::Directory {
            return Err(FileTreeError::NotADirectory(id));
        }
        if node.loaded {
            return Ok(());
        }
        let link = node.content.clone();

        // A slot root whose slot is empty or absent starts out empty.
        if link.slot {
            let slots = self.slots.as_ref().ok_or(FileTreeError::Slot(
                "slot root requires a slot registry".to_string(),
            ))?;
            match slots.get(&link.address).await {
                Ok(address) if address.is_empty() => {
                    let node = state.nodes.get_mut(&id).expect("checked above");
                    node.loaded = true;
                    return Ok(());
                }
                Ok(_) => {}
                Err(RegistryError::NotFound(_)) => {
                    let node = state.nodes.get_mut(&id).expect("checked above");
                    node.loaded = true;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        } else if link.address.is_empty() {
            let node = state.nodes.get_mut(&id).expect("checked above");
            node.loaded = true;
            return Ok(());
        }

        let data = read_to_vec(&link, Arc::clone(&self.store), self.slots.clone()).await?;
        let entries = manifest::decode(&data)?;

        for entry in entries {
            let child_id = state.next_id;
            state.next_id += 1;
            let child = node_from_entry(&entry, id);
            let name = entry.name().to_string();
            state.nodes.insert(child_id, child);
            state
                .nodes
                .get_mut(&id)
                .expect("checked above")
                .children
                .insert(name, child_id);
        }

        state.nodes.get_mut(&id).expect("checked above").loaded = true;
        Ok(())
    }

    async fn sync_node(&self, id: u64) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.nodes.contains_key(&id) {
            return Err(FileTreeError::UnknownNode(id));
        }

        let root_was_dirty = state
            .nodes
            .get(&ROOT_NODE)
            .map(|n| n.dirty)
            .unwrap_or(false);

        // Post-order over the dirty subtree: children serialize before the
        // directories that reference them.
        let order = dirty_postorder(&state, id);
        for node_id in order {
            let node = state.nodes.get(&node_id).expect("collected from state");
            if !node.dirty {
                continue;
            }
            if node.kind == EntryKind::Directory {
                let mut entries = Vec::with_capacity(node.children.len());
                for (name, child_id) in &node.children {
                    let child = state
                        .nodes
                        .get(child_id)
                        .ok_or(FileTreeError::UnknownNode(*child_id))?;
                    entries.push(entry_for(name, child));
                }
                let encoded = manifest::encode(&entries)?;
                let link = write(&encoded, self.store.as_ref(), &self.manifest_options).await?;
                let node = state.nodes.get_mut(&node_id).expect("collected from state");
                node.content = link;
            }
            state.nodes.get_mut(&node_id).expect("collected from state").dirty = false;
        }

        // Publish the new root through the slot CAS. An untouched tree has
        // nothing to publish.
        if id == ROOT_NODE && root_was_dirty && self.is_writable() {
            let new_address = state
                .nodes
                .get(&ROOT_NODE)
                .expect("root always exists")
                .content
                .address
                .clone();
            let slots = self.slots.as_ref().expect("writable implies slots");
            let slot_id = &self.root_link.address;
            let previous = state.last_slot_address.clone();

            let outcome = if previous.is_empty() {
                match slots.create(slot_id, &new_address).await {
                    Err(RegistryError::Conflict(_)) => {
                        slots.update(slot_id, &new_address, &previous).await
                    }
                    other => other,
                }
            } else {
                slots.update(slot_id, &new_address, &previous).await
            };
            outcome?;
            state.last_slot_address = new_address;
        }

        Ok(())
    }

    /// Compare the slot against what we last observed; on divergence,
    /// reconcile the remote root into the local tree. Locally dirty
    /// subtrees always survive.
    async fn poll_slot(&self) -> Result<()> {
        let Some(slots) = self.slots.as_ref() else {
            return Ok(());
        };
        let remote_address = match slots.get(&self.root_link.address).await {
            Ok(address) => address,
            Err(RegistryError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        {
            let state = self.state.read().await;
            let root = state.nodes.get(&ROOT_NODE).expect("root always exists");
            if remote_address == state.last_slot_address
                || remote_address == root.content.address
            {
                return Ok(());
            }
        }

        let mut remote_link = self.root_link.clone();
        remote_link.address = remote_address.clone();
        remote_link.slot = false;
        let data = read_to_vec(&remote_link, Arc::clone(&self.store), self.slots.clone()).await?;
        let entries = manifest::decode(&data)?;

        let mut state = self.state.write().await;
        debug!(address = %remote_address, "reconciling remote root");

        let remote_names: HashMap<&str, &Entry> =
            entries.iter().map(|e| (e.name(), e)).collect();

        // Drop or refresh clean local entries; dirty subtrees stay as they
        // are and win at the next sync.
        let local_children: Vec<(String, u64)> = {
            let root = state.nodes.get(&ROOT_NODE).expect("root always exists");
            root.children
                .iter()
                .map(|(name, id)| (name.clone(), *id))
                .collect()
        };
        for (name, child_id) in local_children {
            if subtree_dirty(&state, child_id) {
                continue;
            }
            state
                .nodes
                .get_mut(&ROOT_NODE)
                .expect("root always exists")
                .children
                .remove(&name);
            unlink(&mut state, child_id, ROOT_NODE);
        }

        let existing: HashSet<String> = state
            .nodes
            .get(&ROOT_NODE)
            .expect("root always exists")
            .children
            .keys()
            .cloned()
            .collect();
        for (name, entry) in remote_names {
            if existing.contains(name) {
                continue;
            }
            let child_id = state.next_id;
            state.next_id += 1;
            let child = node_from_entry(entry, ROOT_NODE);
            state.nodes.insert(child_id, child);
            state
                .nodes
                .get_mut(&ROOT_NODE)
                .expect("root always exists")
                .children
                .insert(name.to_string(), child_id);
        }

        let root = state.nodes.get_mut(&ROOT_NODE).expect("root always exists");
        root.content.address = remote_address.clone();
        root.loaded = true;
        state.last_slot_address = remote_address;
        Ok(())
    }
}

fn node_from_entry(entry: &Entry, parent: u64) -> Node {
    let mut node = Node::new(entry.kind());
    let meta = entry.meta();
    node.name = meta.name.clone();
    node.parents.insert(parent);
    node.create_time = meta.create_time;
    node.modify_time = meta.modify_time;
    node.mode = meta.mode.clone();
    match entry {
        Entry::File {
            content,
            size,
            mime_type,
            ..
        } => {
            node.content = content.clone();
            node.size = *size;
            node.mime_type = mime_type.clone();
        }
        Entry::Directory { content, size, .. } => {
            node.content = content.clone();
            node.size = *size;
        }
        Entry::SymbolicLink { target, .. } => {
            node.target = target.clone();
        }
    }
    node
}

fn entry_for(name: &str, node: &Node) -> Entry {
    let meta = EntryMeta {
        name: name.to_string(),
        create_time: node.create_time,
        modify_time: node.modify_time,
        mode: node.mode.clone(),
    };
    match node.kind {
        EntryKind::File => Entry::File {
            meta,
            content: node.content.clone(),
            size: node.size,
            mime_type: node.mime_type.clone(),
        },
        EntryKind::Directory => Entry::Directory {
            meta,
            content: node.content.clone(),
            size: node.size,
        },
        EntryKind::SymbolicLink => Entry::SymbolicLink {
            meta,
            target: node.target.clone(),
        },
    }
}

/// Mark a node dirty and propagate through every parent, transitively.
/// Hard links mean a node can reach the same ancestor twice; the visited
/// set keeps the walk finite.
fn mark_dirty(state: &mut TreeState, id: u64) {
    let mut pending = vec![id];
    let mut visited = HashSet::new();
    while let Some(current) = pending.pop() {
        if !visited.insert(current) {
            continue;
        }
        if let Some(node) = state.nodes.get_mut(&current) {
            node.dirty = true;
            pending.extend(node.parents.iter().copied());
        }
    }
}

/// Remove `parent` from the node's parent set; free the node and its
/// newly orphaned descendants when the set empties.
fn unlink(state: &mut TreeState, id: u64, parent: u64) {
    let Some(node) = state.nodes.get_mut(&id) else {
        return;
    };
    node.parents.remove(&parent);
    if !node.parents.is_empty() {
        return;
    }
    let children: Vec<u64> = node.children.values().copied().collect();
    state.nodes.remove(&id);
    for child in children {
        unlink(state, child, id);
    }
}

/// Ids of the dirty-reachable subtree under `id`, children before parents.
fn dirty_postorder(state: &TreeState, id: u64) -> Vec<u64> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    postorder_visit(state, id, &mut visited, &mut order);
    order
}

fn postorder_visit(state: &TreeState, id: u64, visited: &mut HashSet<u64>, order: &mut Vec<u64>) {
    if !visited.insert(id) {
        return;
    }
    if let Some(node) = state.nodes.get(&id) {
        for child in node.children.values() {
            postorder_visit(state, *child, visited, order);
        }
        order.push(id);
    }
}

fn subtree_dirty(state: &TreeState, id: u64) -> bool {
    let mut pending = vec![id];
    let mut visited = HashSet::new();
    while let Some(current) = pending.pop() {
        if !visited.insert(current) {
            continue;
        }
        if let Some(node) = state.nodes.get(&current) {
            if node.dirty {
                return true;
            }
            pending.extend(node.children.values().copied());
        }
    }
    false
}
