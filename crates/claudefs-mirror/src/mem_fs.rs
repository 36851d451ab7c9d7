//! In-memory mount with snapshot support and fault injection.
//!
//! `MemMount` implements [`FilesystemClient`] over a flat path map. Snapshot
//! contents are exposed under `<dir>/.snap/<name>` and are read-only. Faults
//! and per-operation delays can be injected to exercise failure and
//! cancellation paths.

use crate::fs::{
    join_path, DirEntry, DirFd, DirStream, FileAttrs, FileType, FilesystemClient, SnapshotInfo,
    Stat, SNAP_DIR,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone)]
enum NodeKind {
    Dir,
    File(Vec<u8>),
    Symlink(String),
    Special,
}

#[derive(Debug, Clone)]
struct Node {
    stat: Stat,
    kind: NodeKind,
    xattrs: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone)]
struct MemSnapshot {
    id: u64,
    name: String,
    metadata: BTreeMap<String, String>,
    /// Keyed by path relative to the snapshotted directory; "" is the root.
    tree: BTreeMap<String, Node>,
}

#[derive(Debug, Clone)]
struct FaultRule {
    op: String,
    path: Option<String>,
}

impl FaultRule {
    fn matches(&self, op: &str, path: &str) -> bool {
        self.op == op && self.path.as_deref().map_or(true, |p| path.contains(p))
    }
}

#[derive(Debug)]
struct MemState {
    nodes: BTreeMap<String, Node>,
    snapshots: HashMap<String, Vec<MemSnapshot>>,
    next_ino: u64,
    next_snap_id: u64,
    next_fd: u64,
    open_fds: HashMap<u64, String>,
    faults: Vec<FaultRule>,
    op_counts: HashMap<String, u64>,
    bytes_written: u64,
    op_delay: Option<Duration>,
}

/// Resolved location of a path: either the live tree or a snapshot tree.
enum Location {
    Live(String),
    Snap {
        dir: String,
        name: String,
        rel: String,
    },
}

fn normalize(path: &str) -> io::Result<String> {
    if !path.starts_with('/') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path must be absolute: {}", path),
        ));
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(trimmed.to_string())
    }
}

fn locate(path: &str) -> io::Result<Location> {
    let path = normalize(path)?;
    let marker = format!("/{}/", SNAP_DIR);
    let (dir, rest) = match path.find(&marker) {
        Some(0) => ("/".to_string(), &path[marker.len()..]),
        Some(idx) => (path[..idx].to_string(), &path[idx + marker.len()..]),
        None => return Ok(Location::Live(path)),
    };
    let (name, rel) = match rest.split_once('/') {
        Some((name, rel)) => (name.to_string(), rel.to_string()),
        None => (rest.to_string(), String::new()),
    };
    Ok(Location::Snap { dir, name, rel })
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

fn children<'a>(map: &'a BTreeMap<String, Node>, parent: &str) -> Vec<(String, &'a Node)> {
    let prefix = if parent == "/" || parent.is_empty() {
        parent.to_string()
    } else {
        format!("{}/", parent)
    };
    map.range(prefix.clone()..)
        .take_while(|(k, _)| k.starts_with(&prefix))
        .filter_map(|(k, node)| {
            let rest = &k[prefix.len()..];
            if rest.is_empty() || rest.contains('/') {
                None
            } else {
                Some((rest.to_string(), node))
            }
        })
        .collect()
}

fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no such entry: {}", path))
}

fn read_only(path: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("snapshot is read-only: {}", path),
    )
}

impl MemState {
    fn new_stat(&mut self, file_type: FileType, mode: u32, size: u64) -> Stat {
        let ino = self.next_ino;
        self.next_ino += 1;
        let now = SystemTime::now();
        Stat {
            ino,
            file_type,
            mode,
            uid: 0,
            gid: 0,
            size,
            rdev: 0,
            atime: now,
            mtime: now,
        }
    }

    fn node(&self, path: &str) -> io::Result<&Node> {
        match locate(path)? {
            Location::Live(p) => self.nodes.get(&p).ok_or_else(|| not_found(path)),
            Location::Snap { dir, name, rel } => self
                .snapshots
                .get(&dir)
                .and_then(|snaps| snaps.iter().find(|s| s.name == name))
                .and_then(|s| s.tree.get(&rel))
                .ok_or_else(|| not_found(path)),
        }
    }

    fn live_path(&self, path: &str) -> io::Result<String> {
        match locate(path)? {
            Location::Live(p) => Ok(p),
            Location::Snap { .. } => Err(read_only(path)),
        }
    }

    fn touch_parent(&mut self, path: &str) {
        if let Some(parent) = parent_of(path) {
            if let Some(node) = self.nodes.get_mut(parent) {
                node.stat.mtime = SystemTime::now();
            }
        }
    }

    fn insert_child(&mut self, path: &str, node: Node) -> io::Result<()> {
        if self.nodes.contains_key(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("entry exists: {}", path),
            ));
        }
        let parent = parent_of(path).ok_or_else(|| not_found(path))?;
        match self.nodes.get(parent) {
            Some(p) if p.stat.is_dir() => {}
            Some(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("not a directory: {}", parent),
                ))
            }
            None => return Err(not_found(parent)),
        }
        self.nodes.insert(path.to_string(), node);
        self.touch_parent(path);
        Ok(())
    }

    fn mkdir(&mut self, path: &str, mode: u32) -> io::Result<()> {
        let stat = self.new_stat(FileType::Directory, mode, 0);
        self.insert_child(
            path,
            Node {
                stat,
                kind: NodeKind::Dir,
                xattrs: BTreeMap::new(),
            },
        )
    }
}

/// An in-memory [`FilesystemClient`].
#[derive(Clone)]
pub struct MemMount {
    state: Arc<Mutex<MemState>>,
    open_streams: Arc<AtomicUsize>,
}

impl MemMount {
    /// Creates an empty mount containing only the root directory.
    pub fn new() -> Self {
        let mut state = MemState {
            nodes: BTreeMap::new(),
            snapshots: HashMap::new(),
            next_ino: 1,
            next_snap_id: 1,
            next_fd: 3,
            open_fds: HashMap::new(),
            faults: Vec::new(),
            op_counts: HashMap::new(),
            bytes_written: 0,
            op_delay: None,
        };
        let stat = state.new_stat(FileType::Directory, 0o755, 0);
        state.nodes.insert(
            "/".to_string(),
            Node {
                stat,
                kind: NodeKind::Dir,
                xattrs: BTreeMap::new(),
            },
        );
        Self {
            state: Arc::new(Mutex::new(state)),
            open_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes every call to `op` fail (optionally only for paths containing `path`).
    pub fn fail_op(&self, op: &str, path: Option<&str>) {
        self.state.lock().faults.push(FaultRule {
            op: op.to_string(),
            path: path.map(str::to_string),
        });
    }

    /// Removes all injected faults.
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Sleeps for `delay` at the start of every operation.
    pub fn set_op_delay(&self, delay: Option<Duration>) {
        self.state.lock().op_delay = delay;
    }

    /// Number of times `op` was invoked.
    pub fn op_count(&self, op: &str) -> u64 {
        self.state.lock().op_counts.get(op).copied().unwrap_or(0)
    }

    /// Total bytes written through `create_file` writers.
    pub fn bytes_written(&self) -> u64 {
        self.state.lock().bytes_written
    }

    /// Number of descriptors opened with `open_dir` and not yet closed.
    pub fn open_dir_count(&self) -> usize {
        self.state.lock().open_fds.len()
    }

    /// Number of directory streams currently alive.
    pub fn open_stream_count(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    /// Writes a whole file, creating missing parent directories.
    pub fn write_file(&self, path: &str, data: &[u8]) -> io::Result<()> {
        if let Some(parent) = parent_of(&normalize(path)?) {
            self.mkdirs(parent, 0o755)?;
        }
        let mut w = self.create_file(path, 0o644)?;
        w.write_all(data)?;
        w.flush()
    }

    /// Reads a whole file.
    pub fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.open_read(path)?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Names of the entries of a directory, sorted.
    pub fn list(&self, path: &str) -> io::Result<Vec<String>> {
        let mut stream = self.read_dir(path)?;
        let mut names = Vec::new();
        while let Some(entry) = stream.next_entry()? {
            names.push(entry.name);
        }
        names.sort();
        Ok(names)
    }

    fn enter(&self, op: &str, path: &str) -> io::Result<()> {
        let delay = {
            let mut st = self.state.lock();
            *st.op_counts.entry(op.to_string()).or_insert(0) += 1;
            if st.faults.iter().any(|f| f.matches(op, path)) {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("injected {} failure on {}", op, path),
                ));
            }
            st.op_delay
        };
        if let Some(d) = delay {
            std::thread::sleep(d);
        }
        Ok(())
    }
}

impl Default for MemMount {
    fn default() -> Self {
        Self::new()
    }
}

struct MemDirStream {
    entries: std::vec::IntoIter<DirEntry>,
    open_streams: Arc<AtomicUsize>,
}

impl DirStream for MemDirStream {
    fn next_entry(&mut self) -> io::Result<Option<DirEntry>> {
        Ok(self.entries.next())
    }
}

impl Drop for MemDirStream {
    fn drop(&mut self) {
        self.open_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemWriter {
    state: Arc<Mutex<MemState>>,
    path: String,
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut st = self.state.lock();
        let node = st
            .nodes
            .get_mut(&self.path)
            .ok_or_else(|| not_found(&self.path))?;
        match &mut node.kind {
            NodeKind::File(data) => {
                data.extend_from_slice(buf);
                node.stat.size = data.len() as u64;
                node.stat.mtime = SystemTime::now();
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("not a regular file: {}", self.path),
                ))
            }
        }
        st.bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FilesystemClient for MemMount {
    fn stat(&self, path: &str) -> io::Result<Stat> {
        self.enter("stat", path)?;
        let st = self.state.lock();
        Ok(st.node(path)?.stat.clone())
    }

    fn open_dir(&self, path: &str) -> io::Result<DirFd> {
        self.enter("open_dir", path)?;
        let mut st = self.state.lock();
        if !st.node(path)?.stat.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("not a directory: {}", path),
            ));
        }
        let fd = st.next_fd;
        st.next_fd += 1;
        st.open_fds.insert(fd, path.to_string());
        Ok(DirFd(fd))
    }

    fn close_dir(&self, fd: DirFd) -> io::Result<()> {
        let mut st = self.state.lock();
        st.open_fds
            .remove(&fd.0)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bad descriptor"))
    }

    fn read_dir(&self, path: &str) -> io::Result<Box<dyn DirStream>> {
        self.enter("read_dir", path)?;
        let st = self.state.lock();
        let entries: Vec<DirEntry> = match locate(path)? {
            Location::Live(p) => {
                if !st.nodes.get(&p).ok_or_else(|| not_found(path))?.stat.is_dir() {
                    return Err(io::Error::new(io::ErrorKind::Other, "not a directory"));
                }
                children(&st.nodes, &p)
                    .into_iter()
                    .map(|(name, node)| DirEntry {
                        name,
                        stat: node.stat.clone(),
                    })
                    .collect()
            }
            Location::Snap { dir, name, rel } => {
                let snap = st
                    .snapshots
                    .get(&dir)
                    .and_then(|snaps| snaps.iter().find(|s| s.name == name))
                    .ok_or_else(|| not_found(path))?;
                if !snap.tree.get(&rel).ok_or_else(|| not_found(path))?.stat.is_dir() {
                    return Err(io::Error::new(io::ErrorKind::Other, "not a directory"));
                }
                children(&snap.tree, &rel)
                    .into_iter()
                    .map(|(name, node)| DirEntry {
                        name,
                        stat: node.stat.clone(),
                    })
                    .collect()
            }
        };
        self.open_streams.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemDirStream {
            entries: entries.into_iter(),
            open_streams: Arc::clone(&self.open_streams),
        }))
    }

    fn mkdir(&self, path: &str, mode: u32) -> io::Result<()> {
        self.enter("mkdir", path)?;
        let mut st = self.state.lock();
        let p = st.live_path(path)?;
        st.mkdir(&p, mode)
    }

    fn mkdirs(&self, path: &str, mode: u32) -> io::Result<()> {
        self.enter("mkdirs", path)?;
        let mut st = self.state.lock();
        let p = st.live_path(path)?;
        let mut current = String::new();
        for component in p.split('/').filter(|c| !c.is_empty()) {
            current = format!("{}/{}", current, component);
            match st.nodes.get(&current) {
                Some(node) if node.stat.is_dir() => continue,
                Some(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("not a directory: {}", current),
                    ))
                }
                None => st.mkdir(&current, mode)?,
            }
        }
        Ok(())
    }

    fn rmdir(&self, path: &str) -> io::Result<()> {
        self.enter("rmdir", path)?;
        let mut st = self.state.lock();
        let p = st.live_path(path)?;
        let node = st.nodes.get(&p).ok_or_else(|| not_found(path))?;
        if !node.stat.is_dir() {
            return Err(io::Error::new(io::ErrorKind::Other, "not a directory"));
        }
        if p == "/" || !children(&st.nodes, &p).is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("directory not empty: {}", path),
            ));
        }
        st.nodes.remove(&p);
        st.touch_parent(&p);
        Ok(())
    }

    fn unlink(&self, path: &str) -> io::Result<()> {
        self.enter("unlink", path)?;
        let mut st = self.state.lock();
        let p = st.live_path(path)?;
        let node = st.nodes.get(&p).ok_or_else(|| not_found(path))?;
        if node.stat.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("is a directory: {}", path),
            ));
        }
        st.nodes.remove(&p);
        st.touch_parent(&p);
        Ok(())
    }

    fn symlink(&self, target: &str, path: &str) -> io::Result<()> {
        self.enter("symlink", path)?;
        let mut st = self.state.lock();
        let p = st.live_path(path)?;
        let stat = st.new_stat(FileType::Symlink, 0o777, target.len() as u64);
        st.insert_child(
            &p,
            Node {
                stat,
                kind: NodeKind::Symlink(target.to_string()),
                xattrs: BTreeMap::new(),
            },
        )
    }

    fn mknod(&self, path: &str, file_type: FileType, mode: u32, rdev: u64) -> io::Result<()> {
        self.enter("mknod", path)?;
        if !file_type.is_special() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("mknod cannot create {:?}: {}", file_type, path),
            ));
        }
        let mut st = self.state.lock();
        let p = st.live_path(path)?;
        let mut stat = st.new_stat(file_type, mode, 0);
        if matches!(file_type, FileType::CharDevice | FileType::BlockDevice) {
            stat.rdev = rdev;
        }
        st.insert_child(
            &p,
            Node {
                stat,
                kind: NodeKind::Special,
                xattrs: BTreeMap::new(),
            },
        )
    }

    fn readlink(&self, path: &str) -> io::Result<String> {
        self.enter("readlink", path)?;
        let st = self.state.lock();
        match &st.node(path)?.kind {
            NodeKind::Symlink(target) => Ok(target.clone()),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "not a symlink")),
        }
    }

    fn open_read(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        self.enter("open_read", path)?;
        let st = self.state.lock();
        match &st.node(path)?.kind {
            NodeKind::File(data) => Ok(Box::new(io::Cursor::new(data.clone()))),
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("not a regular file: {}", path),
            )),
        }
    }

    fn create_file(&self, path: &str, mode: u32) -> io::Result<Box<dyn Write + Send>> {
        self.enter("create_file", path)?;
        let mut st = self.state.lock();
        let p = st.live_path(path)?;
        match st.nodes.get_mut(&p) {
            Some(node) => match &mut node.kind {
                NodeKind::File(data) => {
                    data.clear();
                    node.stat.size = 0;
                    node.stat.mtime = SystemTime::now();
                }
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("not a regular file: {}", path),
                    ))
                }
            },
            None => {
                let stat = st.new_stat(FileType::File, mode, 0);
                st.insert_child(
                    &p,
                    Node {
                        stat,
                        kind: NodeKind::File(Vec::new()),
                        xattrs: BTreeMap::new(),
                    },
                )?;
            }
        }
        Ok(Box::new(MemWriter {
            state: Arc::clone(&self.state),
            path: p,
        }))
    }

    fn set_attrs(&self, path: &str, attrs: &FileAttrs) -> io::Result<()> {
        self.enter("set_attrs", path)?;
        let mut st = self.state.lock();
        let p = st.live_path(path)?;
        let node = st.nodes.get_mut(&p).ok_or_else(|| not_found(path))?;
        if !node.stat.is_symlink() {
            node.stat.mode = attrs.mode;
        }
        node.stat.uid = attrs.uid;
        node.stat.gid = attrs.gid;
        node.stat.atime = attrs.atime;
        node.stat.mtime = attrs.mtime;
        Ok(())
    }

    fn get_xattr(&self, path: &str, name: &str) -> io::Result<Option<Vec<u8>>> {
        self.enter("get_xattr", path)?;
        let st = self.state.lock();
        Ok(st.node(path)?.xattrs.get(name).cloned())
    }

    fn set_xattr(&self, path: &str, name: &str, value: &[u8]) -> io::Result<()> {
        self.enter("set_xattr", path)?;
        let mut st = self.state.lock();
        let p = st.live_path(path)?;
        let node = st.nodes.get_mut(&p).ok_or_else(|| not_found(path))?;
        node.xattrs.insert(name.to_string(), value.to_vec());
        Ok(())
    }

    fn list_snapshots(&self, dir: &str) -> io::Result<Vec<SnapshotInfo>> {
        self.enter("list_snapshots", dir)?;
        let st = self.state.lock();
        let d = st.live_path(dir)?;
        if !st.nodes.get(&d).ok_or_else(|| not_found(dir))?.stat.is_dir() {
            return Err(io::Error::new(io::ErrorKind::Other, "not a directory"));
        }
        Ok(st
            .snapshots
            .get(&d)
            .map(|snaps| {
                snaps
                    .iter()
                    .map(|s| SnapshotInfo {
                        id: s.id,
                        name: s.name.clone(),
                        metadata: s.metadata.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn create_snapshot(
        &self,
        dir: &str,
        name: &str,
        metadata: &BTreeMap<String, String>,
    ) -> io::Result<()> {
        self.enter("create_snapshot", dir)?;
        let mut st = self.state.lock();
        let d = st.live_path(dir)?;
        if !st.nodes.get(&d).ok_or_else(|| not_found(dir))?.stat.is_dir() {
            return Err(io::Error::new(io::ErrorKind::Other, "not a directory"));
        }
        if name.is_empty() || name.contains('/') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid snapshot name: {:?}", name),
            ));
        }
        if st
            .snapshots
            .get(&d)
            .map_or(false, |snaps| snaps.iter().any(|s| s.name == name))
        {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("snapshot exists: {}", name),
            ));
        }
        let prefix = if d == "/" { "/".to_string() } else { format!("{}/", d) };
        let mut tree = BTreeMap::new();
        for (key, node) in st
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
        {
            tree.insert(key[prefix.len()..].to_string(), node.clone());
        }
        if let Some(root) = st.nodes.get(&d) {
            tree.insert(String::new(), root.clone());
        }
        let id = st.next_snap_id;
        st.next_snap_id += 1;
        st.snapshots.entry(d).or_default().push(MemSnapshot {
            id,
            name: name.to_string(),
            metadata: metadata.clone(),
            tree,
        });
        Ok(())
    }

    fn remove_snapshot(&self, dir: &str, name: &str) -> io::Result<()> {
        self.enter("remove_snapshot", dir)?;
        let mut st = self.state.lock();
        let d = st.live_path(dir)?;
        let snaps = st
            .snapshots
            .get_mut(&d)
            .ok_or_else(|| not_found(&join_path(dir, name)))?;
        let idx = snaps
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| not_found(&join_path(dir, name)))?;
        snaps.remove(idx);
        Ok(())
    }

    fn rename_snapshot(&self, dir: &str, from: &str, to: &str) -> io::Result<()> {
        self.enter("rename_snapshot", dir)?;
        let mut st = self.state.lock();
        let d = st.live_path(dir)?;
        let snaps = st
            .snapshots
            .get_mut(&d)
            .ok_or_else(|| not_found(&join_path(dir, from)))?;
        if snaps.iter().any(|s| s.name == to) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("snapshot exists: {}", to),
            ));
        }
        let snap = snaps
            .iter_mut()
            .find(|s| s.name == from)
            .ok_or_else(|| not_found(&join_path(dir, from)))?;
        snap.name = to.to_string();
        Ok(())
    }
}
