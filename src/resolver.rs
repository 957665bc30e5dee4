//! Path resolution.
//!
//! Walks a textual path component by component from a starting node (the
//! context root, the working directory, or a directory descriptor's node),
//! consulting the per-mount entry cache before the driver, stepping across
//! mount covers in both directions, and chasing symbolic links up to the
//! recursion ceiling. `..` at the context root is consumed as a no-op so a
//! chroot jail stays closed.

use std::sync::Arc;

use memchr::memchr;

use crate::context::IoContext;
use crate::errno::{Errno, Result};
use crate::ids::NodeId;
use crate::node::Vnode;
use crate::vfs::Vfs;
use crate::{MAX_FILE_NAME, MAX_PATH, MAX_SYMLINKS};

/// Result of a successful path walk: the target node (with a reference)
/// and the id of the directory it was found in.
pub(crate) struct WalkOutcome {
    pub(crate) node: Arc<Vnode>,
    pub(crate) parent: NodeId,
}

/// Filled in when a walk fails at the leaf: the last resolved directory
/// (with a reference) and the unresolved component, so create-if-missing
/// callers can continue.
pub(crate) type LeafHint = Option<(Arc<Vnode>, String)>;

/// Splits off the first path component. Returns the component, the rest
/// with separators skipped, and whether a separator followed (i.e. the
/// component names a directory).
fn next_component(path: &str) -> (&str, &str, bool) {
    match memchr(b'/', path.as_bytes()) {
        Some(end) => {
            let mut rest = &path[end..];
            while let Some(stripped) = rest.strip_prefix('/') {
                rest = stripped;
            }
            (&path[..end], rest, true)
        }
        None => (path, "", false),
    }
}

impl Vfs {
    /// Looks `name` up in `dir`, consulting the entry cache first. On a
    /// driver round trip the result (positive or negative) is cached.
    /// Returns a referenced node.
    pub(crate) fn lookup_dir_entry(&self, dir: &Arc<Vnode>, name: &str) -> Result<Arc<Vnode>> {
        let cache = &dir.mount().entry_cache;
        if let Some((id, missing)) = cache.lookup(dir.id(), name) {
            if missing {
                return Err(Errno::ENOENT);
            }
            return self.get_vnode(dir.device(), id, true, false);
        }

        match dir.ops().lookup(dir, name) {
            Ok(id) => {
                let child = self.get_vnode(dir.device(), id, true, false)?;
                cache.add(dir.id(), name, id, false);
                Ok(child)
            }
            Err(Errno::ENOENT) => {
                cache.add(dir.id(), name, NodeId(-1), true);
                Err(Errno::ENOENT)
            }
            Err(error) => Err(error),
        }
    }

    /// Walks `path` starting at `start`, whose reference is consumed no
    /// matter the outcome. See the module docs for the traversal rules.
    pub(crate) fn walk_path(
        &self,
        context: &IoContext,
        start: Arc<Vnode>,
        path: &str,
        traverse_leaf: bool,
        depth: u32,
        mut leaf: Option<&mut LeafHint>,
    ) -> Result<WalkOutcome> {
        if path.len() >= MAX_PATH {
            self.dec_node_ref(&start, false, false);
            return Err(Errno::ENAMETOOLONG);
        }
        if path.is_empty() {
            self.dec_node_ref(&start, false, false);
            return Err(Errno::ENOENT);
        }

        let mut node = start;
        let mut parent = node.id();
        let mut rest = path;

        loop {
            if rest.is_empty() {
                break;
            }

            let (component, next_rest, directory_found) = next_component(rest);
            if component.len() >= MAX_FILE_NAME {
                self.dec_node_ref(&node, false, false);
                return Err(Errno::ENAMETOOLONG);
            }

            if component == ".." {
                // `..` at the context root is consumed without moving.
                let at_root = context
                    .root
                    .lock()
                    .as_ref()
                    .is_some_and(|root| Arc::ptr_eq(root, &node));
                if at_root {
                    rest = next_rest;
                    continue;
                }

                // Step below a covering root first, so the driver sees the
                // `..` of the underlying directory.
                if let Some(covered) = self.get_covered_node(&node) {
                    self.dec_node_ref(&node, false, false);
                    node = covered;
                }
            }

            let mut status = if node.is_directory() {
                node.ops().access(&node, libc::X_OK)
            } else {
                Err(Errno::ENOTDIR)
            };

            let mut child = None;
            if status.is_ok() {
                match self.lookup_dir_entry(&node, component) {
                    Ok(found) => child = Some(found),
                    Err(error) => status = Err(error),
                }
            }

            let mut child = match (status, child) {
                (Ok(()), Some(child)) => child,
                (Err(error), _) => {
                    if !directory_found {
                        if let Some(slot) = leaf.as_mut() {
                            // Hand the last directory to the caller so a
                            // create-if-missing path can continue.
                            **slot = Some((node, component.to_owned()));
                            return Err(error);
                        }
                    }
                    self.dec_node_ref(&node, false, false);
                    return Err(error);
                }
                (Ok(()), None) => unreachable!(),
            };

            if child.is_symlink() && (traverse_leaf || directory_found) {
                if depth + 1 > MAX_SYMLINKS {
                    self.dec_node_ref(&child, false, false);
                    self.dec_node_ref(&node, false, false);
                    return Err(Errno::ELOOP);
                }

                let target = match child.ops().read_symlink(&child) {
                    Ok(target) => target,
                    Err(error) => {
                        self.dec_node_ref(&child, false, false);
                        self.dec_node_ref(&node, false, false);
                        return Err(error);
                    }
                };
                self.dec_node_ref(&child, false, false);

                let mut link_path = target.as_str();
                let mut absolute = false;
                if let Some(stripped) = link_path.strip_prefix('/') {
                    // Absolute target: restart from the context root.
                    link_path = stripped.trim_start_matches('/');
                    absolute = true;

                    self.dec_node_ref(&node, false, false);
                    node = self.context_root(context)?;
                }

                if absolute && link_path.is_empty() {
                    // The link target was just "/".
                    child = node.clone();
                    self.inc_node_ref(&child);
                } else {
                    // The recursion consumes one reference to the start.
                    self.inc_node_ref(&node);
                    let outcome = self.walk_path(
                        context,
                        node.clone(),
                        link_path,
                        true,
                        depth + 1,
                        leaf.as_mut().map(|slot| &mut **slot),
                    );
                    match outcome {
                        Ok(outcome) => {
                            parent = outcome.parent;
                            child = outcome.node;
                        }
                        Err(error) => {
                            self.dec_node_ref(&node, false, false);
                            return Err(error);
                        }
                    }
                }
            } else {
                parent = node.id();
            }

            // A trailing slash forces the leaf to be a directory.
            if directory_found && next_rest.is_empty() && !child.is_directory() {
                self.dec_node_ref(&child, false, false);
                self.dec_node_ref(&node, false, false);
                return Err(Errno::ENOTDIR);
            }

            self.dec_node_ref(&node, false, false);
            node = child;
            rest = next_rest;

            // Entering a covered directory jumps to the covering root.
            if let Some(covering) = self.get_covering_node(&node) {
                self.dec_node_ref(&node, false, false);
                node = covering;
            }
        }

        Ok(WalkOutcome { node, parent })
    }

    /// A reference to the context's root, falling back to the global root.
    pub(crate) fn context_root(&self, context: &IoContext) -> Result<Arc<Vnode>> {
        if let Some(root) = context.root.lock().as_ref() {
            self.inc_node_ref(root);
            return Ok(root.clone());
        }
        let root = self.global_root().ok_or(Errno::ENOENT)?;
        self.inc_node_ref(&root);
        Ok(root)
    }

    fn context_cwd(&self, context: &IoContext) -> Result<Arc<Vnode>> {
        if let Some(cwd) = context.cwd.lock().as_ref() {
            self.inc_node_ref(cwd);
            return Ok(cwd.clone());
        }
        self.context_root(context)
    }

    /// Resolves `path` from the context root (absolute) or working
    /// directory (relative).
    pub(crate) fn path_to_node(
        &self,
        context: &IoContext,
        path: &str,
        traverse_leaf: bool,
        leaf: Option<&mut LeafHint>,
    ) -> Result<WalkOutcome> {
        if path.is_empty() {
            return Err(Errno::ENOENT);
        }
        if path.len() >= MAX_PATH {
            return Err(Errno::ENAMETOOLONG);
        }

        if let Some(stripped) = path.strip_prefix('/') {
            let rest = stripped.trim_start_matches('/');
            let root = self.context_root(context)?;
            if rest.is_empty() {
                let parent = root.id();
                return Ok(WalkOutcome { node: root, parent });
            }
            return self.walk_path(context, root, rest, traverse_leaf, 0, leaf);
        }

        let start = self.context_cwd(context)?;
        self.walk_path(context, start, path, traverse_leaf, 0, leaf)
    }

    /// Resolves a descriptor + path pair: an absolute `path` ignores `fd`;
    /// `None` means the working directory; otherwise the walk starts at
    /// the descriptor's (directory) node.
    pub(crate) fn fd_and_path_to_node(
        &self,
        context: &IoContext,
        fd: Option<i32>,
        path: &str,
        traverse_leaf: bool,
        leaf: Option<&mut LeafHint>,
    ) -> Result<WalkOutcome> {
        let Some(fd) = fd else {
            return self.path_to_node(context, path, traverse_leaf, leaf);
        };
        if path.starts_with('/') {
            return self.path_to_node(context, path, traverse_leaf, leaf);
        }
        if path.is_empty() {
            return Err(Errno::ENOENT);
        }

        let descriptor = self.get_fd(context, fd)?;
        let start = match descriptor.node() {
            Some(node) => {
                self.inc_node_ref(node);
                node.clone()
            }
            None => {
                self.put_fd(&descriptor);
                return Err(Errno::ENOTDIR);
            }
        };
        self.put_fd(&descriptor);

        self.walk_path(context, start, path, traverse_leaf, 0, leaf)
    }

    /// Resolves the directory part of `path` and returns it together with
    /// the leaf name. The leaf may be `.` or `..`; callers reject those
    /// where the operation demands it.
    pub(crate) fn fd_and_path_to_dir(
        &self,
        context: &IoContext,
        fd: Option<i32>,
        path: &str,
    ) -> Result<(Arc<Vnode>, String)> {
        let (dir_part, name) = split_dir_and_leaf(path)?;
        let outcome = self.fd_and_path_to_node(context, fd, &dir_part, true, None)?;
        if !outcome.node.is_directory() {
            self.dec_node_ref(&outcome.node, false, false);
            return Err(Errno::ENOTDIR);
        }
        Ok((outcome.node, name))
    }

    /// Produces the absolute path of the directory `node`, read back by
    /// scanning parent directories. Consumes the node's reference.
    pub(crate) fn dir_node_to_path(&self, context: &IoContext, node: Arc<Vnode>) -> Result<String> {
        if !node.is_directory() {
            self.dec_node_ref(&node, false, false);
            return Err(Errno::ENOTDIR);
        }

        let root = self.context_root(context)?;
        let mut components: Vec<String> = Vec::new();
        let mut current = node;

        while !Arc::ptr_eq(&current, &root) {
            // The entry in the parent names the covered directory, not the
            // mount root layered over it.
            let named = match self.get_covered_node(&current) {
                Some(covered) => {
                    let named = (covered.device(), covered.id());
                    self.dec_node_ref(&covered, false, false);
                    named
                }
                None => (current.device(), current.id()),
            };

            self.inc_node_ref(&current);
            let parent = match self.walk_path(context, current.clone(), "..", false, 0, None) {
                Ok(outcome) => outcome.node,
                Err(error) => {
                    self.dec_node_ref(&current, false, false);
                    self.dec_node_ref(&root, false, false);
                    return Err(error);
                }
            };
            if Arc::ptr_eq(&parent, &current) {
                // Reached a root outside the context's jail.
                self.dec_node_ref(&parent, false, false);
                break;
            }

            let name = match self.find_entry_name(&parent, named) {
                Ok(name) => name,
                Err(error) => {
                    self.dec_node_ref(&parent, false, false);
                    self.dec_node_ref(&current, false, false);
                    self.dec_node_ref(&root, false, false);
                    return Err(error);
                }
            };
            components.push(name);

            self.dec_node_ref(&current, false, false);
            current = parent;
        }

        self.dec_node_ref(&current, false, false);
        self.dec_node_ref(&root, false, false);

        if components.is_empty() {
            return Ok("/".to_owned());
        }
        components.reverse();
        Ok(format!("/{}", components.join("/")))
    }

    /// Scans `dir` for the entry referring to `target`.
    fn find_entry_name(
        &self,
        dir: &Arc<Vnode>,
        target: (crate::ids::DeviceId, NodeId),
    ) -> Result<String> {
        let mut cookie = dir.ops().open_dir(dir)?;
        while let Some(entry) = cookie.read_entry()? {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            if entry.node == target.1 && entry.device == target.0 {
                return Ok(entry.name);
            }
        }
        Err(Errno::ENOENT)
    }
}

/// Splits `path` into its directory part and leaf name, textually.
pub(crate) fn split_dir_and_leaf(path: &str) -> Result<(String, String)> {
    if path.is_empty() {
        return Err(Errno::ENOENT);
    }

    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        // The path names the root itself.
        return Ok(("/".to_owned(), ".".to_owned()));
    }

    let (dir, leaf) = match trimmed.rfind('/') {
        Some(position) => {
            let dir = &trimmed[..position];
            let leaf = &trimmed[position + 1..];
            if dir.is_empty() {
                ("/", leaf)
            } else {
                (dir, leaf)
            }
        }
        None => (".", trimmed),
    };

    if leaf.len() >= MAX_FILE_NAME {
        return Err(Errno::ENAMETOOLONG);
    }
    Ok((dir.to_owned(), leaf.to_owned()))
}

/// Normalizes a path textually: collapses repeated separators, drops `.`
/// components, folds `..` into the preceding component where one exists,
/// and strips any trailing separator. Normalization is idempotent.
pub fn normalize_path(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(Errno::EINVAL);
    }
    if path.len() >= MAX_PATH {
        return Err(Errno::ENAMETOOLONG);
    }

    let absolute = path.starts_with('/');
    let mut components: Vec<&str> = Vec::new();

    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if components.last().is_some_and(|last| *last != "..") {
                    components.pop();
                } else if !absolute {
                    // A relative path may keep leading `..` components.
                    components.push("..");
                }
                // `..` at an absolute root stays at the root.
            }
            name => components.push(name),
        }
    }

    let joined = components.join("/");
    Ok(match (absolute, joined.is_empty()) {
        (true, true) => "/".to_owned(),
        (true, false) => format!("/{joined}"),
        (false, true) => ".".to_owned(),
        (false, false) => joined,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_splitting() {
        assert_eq!(next_component("a/b/c"), ("a", "b/c", true));
        assert_eq!(next_component("a//b"), ("a", "b", true));
        assert_eq!(next_component("leaf"), ("leaf", "", false));
        assert_eq!(next_component("dir/"), ("dir", "", true));
    }

    #[test]
    fn dir_and_leaf_splitting() {
        assert_eq!(
            split_dir_and_leaf("a/b/c").unwrap(),
            ("a/b".to_owned(), "c".to_owned())
        );
        assert_eq!(
            split_dir_and_leaf("foo").unwrap(),
            (".".to_owned(), "foo".to_owned())
        );
        assert_eq!(
            split_dir_and_leaf("/x").unwrap(),
            ("/".to_owned(), "x".to_owned())
        );
        assert_eq!(
            split_dir_and_leaf("/x/y///").unwrap(),
            ("/x".to_owned(), "y".to_owned())
        );
        assert_eq!(
            split_dir_and_leaf("/").unwrap(),
            ("/".to_owned(), ".".to_owned())
        );
        assert_eq!(split_dir_and_leaf(""), Err(Errno::ENOENT));
    }

    #[test]
    fn normalization_is_idempotent() {
        for path in [
            "/a/b/../c/./d//",
            "a/./b/..",
            "../../x",
            "/..",
            "/",
            "a//b///c",
        ] {
            let once = normalize_path(path).unwrap();
            let twice = normalize_path(&once).unwrap();
            assert_eq!(once, twice, "normalizing {path:?}");
        }
    }

    #[test]
    fn normalization_examples() {
        assert_eq!(normalize_path("/a/b/../c").unwrap(), "/a/c");
        assert_eq!(normalize_path("/..").unwrap(), "/");
        assert_eq!(normalize_path("a/..").unwrap(), ".");
        assert_eq!(normalize_path("../a").unwrap(), "../a");
        assert_eq!(normalize_path("/a/b/").unwrap(), "/a/b");
    }
}
