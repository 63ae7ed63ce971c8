//! 内存文件索引
//!
//! 节点表记录每个 FRN 的父目录与名称，索引视图是由节点表投影出来的
//! 扁平文件序列，FRN → 下标映射让增量更新可以 O(1) 定位。

use rustc_hash::{FxHashMap, FxHashSet};

use crate::records::{
    ChangeRecord, REASON_FILE_DELETE, REASON_RENAME_NEW_NAME, REASON_RENAME_OLD_NAME,
};

/// 路径分隔符（NTFS 卷）
pub const PATH_SEPARATOR: char = '\\';

/// 节点表条目，根节点名称为空且父 FRN 指向自身
#[derive(Debug, Clone)]
pub struct Node {
    pub parent_frn: u64,
    pub name: String,
    pub is_directory: bool,
}

/// 索引视图中的一项
#[derive(Debug, Clone)]
pub struct IndexedFile {
    pub frn: u64,
    pub name: String,
    pub path: String,
    pub extension: String,
    pub is_directory: bool,
}

pub type NodeTable = FxHashMap<u64, Node>;

/// 一次完整枚举的产出，发布后成为全局索引
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    pub files: Vec<IndexedFile>,
    pub nodes: NodeTable,
    pub root_frn: u64,
    pub root_path: String,
    pub journal_id: u64,
    pub journal_next_usn: i64,
    pub live_updates_supported: bool,
}

/// 全局索引的内部状态，读写锁由调用方持有
#[derive(Debug, Default)]
pub struct VolumeIndex {
    pub files: Vec<IndexedFile>,
    pub positions: FxHashMap<u64, usize>,
    pub nodes: NodeTable,
    pub root_frn: u64,
    pub root_path: String,
}

/// 从文件名提取小写扩展名，目录和无内部点的名称返回空串
pub fn extension_of(name: &str, is_directory: bool) -> String {
    if is_directory {
        return String::new();
    }
    match name.rfind('.') {
        Some(dot) if dot > 0 && dot + 1 < name.len() => name[dot + 1..].to_lowercase(),
        _ => String::new(),
    }
}

/// 沿父链解析绝对路径，带记忆化缓存。
///
/// `resolving` 记录本次解析中正在处理的 FRN，重入即视为父链成环，
/// 返回 None 让调用方跳过该节点。
pub fn resolve_path(
    frn: u64,
    root_frn: u64,
    root_path: &str,
    nodes: &NodeTable,
    cache: &mut FxHashMap<u64, String>,
    resolving: &mut FxHashSet<u64>,
) -> Option<String> {
    if let Some(cached) = cache.get(&frn) {
        return Some(cached.clone());
    }
    if frn == root_frn {
        return Some(root_path.to_string());
    }

    let node = nodes.get(&frn)?;
    if !resolving.insert(frn) {
        return None;
    }

    let parent = resolve_path(node.parent_frn, root_frn, root_path, nodes, cache, resolving);
    resolving.remove(&frn);
    let parent = parent?;

    let mut full = parent;
    if !full.ends_with(PATH_SEPARATOR) {
        full.push(PATH_SEPARATOR);
    }
    full.push_str(&node.name);
    cache.insert(frn, full.clone());
    Some(full)
}

/// 把节点表投影成索引视图，`is_cancelled` 为真时中断并返回 None
pub fn project_files(
    nodes: &NodeTable,
    root_frn: u64,
    root_path: &str,
    include_directories: bool,
    is_cancelled: &dyn Fn() -> bool,
) -> Option<Vec<IndexedFile>> {
    let mut cache: FxHashMap<u64, String> =
        FxHashMap::with_capacity_and_hasher(nodes.len() / 2 + 1, Default::default());
    cache.insert(root_frn, root_path.to_string());
    let mut resolving = FxHashSet::default();
    let mut files = Vec::with_capacity(nodes.len() / 2 + 1);

    for (&frn, node) in nodes {
        if is_cancelled() {
            return None;
        }
        if node.name.is_empty() || (node.is_directory && !include_directories) {
            continue;
        }

        resolving.clear();
        let Some(path) = resolve_path(frn, root_frn, root_path, nodes, &mut cache, &mut resolving)
        else {
            continue;
        };
        if path.is_empty() {
            continue;
        }

        files.push(IndexedFile {
            frn,
            name: node.name.clone(),
            path,
            extension: extension_of(&node.name, node.is_directory),
            is_directory: node.is_directory,
        });
    }

    Some(files)
}

impl VolumeIndex {
    /// 重建 FRN → 下标映射
    pub fn rebuild_positions(&mut self) {
        self.positions.clear();
        self.positions.reserve(self.files.len());
        for (i, file) in self.files.iter().enumerate() {
            self.positions.insert(file.frn, i);
        }
    }

    /// 交换删除：末尾元素顶替被删位置并更新映射
    pub fn remove_by_frn(&mut self, frn: u64) {
        let Some(remove_index) = self.positions.remove(&frn) else {
            return;
        };
        let last_index = self.files.len() - 1;
        if remove_index != last_index {
            self.files.swap(remove_index, last_index);
            self.positions.insert(self.files[remove_index].frn, remove_index);
        }
        self.files.pop();
    }

    /// 插入或就地替换一个索引项
    pub fn upsert_file(&mut self, frn: u64, name: &str, path: String, is_directory: bool) {
        let next = IndexedFile {
            frn,
            name: name.to_string(),
            path,
            extension: extension_of(name, is_directory),
            is_directory,
        };
        match self.positions.get(&frn) {
            Some(&at) => self.files[at] = next,
            None => {
                self.positions.insert(frn, self.files.len());
                self.files.push(next);
            }
        }
    }

    /// 从节点表整体重建索引视图（目录改名/删除后的兜底路径）
    pub fn rebuild_from_nodes(&mut self, include_directories: bool) {
        self.files.clear();
        self.positions.clear();
        if self.root_frn == 0 || self.root_path.is_empty() || self.nodes.is_empty() {
            return;
        }

        let files = project_files(
            &self.nodes,
            self.root_frn,
            &self.root_path,
            include_directories,
            &|| false,
        )
        .unwrap_or_default();
        self.files = files;
        self.rebuild_positions();
    }

    /// 应用一批日志记录，返回更新后的索引项数量。
    ///
    /// 规则：
    /// - 重命名的旧名记录（有旧名、无新名、非删除）直接忽略，等配对的新名记录；
    /// - 删除记录移除节点和索引项，被删的是目录时整体重建；
    /// - 其余记录更新节点，目录的父或名称变化会触发批后重建，
    ///   文件则用批内缓存解析路径后 upsert。
    pub fn apply_change_batch(
        &mut self,
        entries: &[ChangeRecord],
        include_directories: bool,
    ) -> usize {
        if self.root_frn == 0 || self.root_path.is_empty() || entries.is_empty() {
            return self.files.len();
        }

        let mut requires_full_rebuild = false;
        let mut cache: FxHashMap<u64, String> =
            FxHashMap::with_capacity_and_hasher(entries.len() * 2 + 8, Default::default());
        cache.insert(self.root_frn, self.root_path.clone());
        let mut resolving = FxHashSet::default();

        for entry in entries {
            if entry.frn == 0 || entry.name.is_empty() {
                continue;
            }

            let is_delete = entry.reason & REASON_FILE_DELETE != 0;
            let is_old_rename_only = entry.reason & REASON_RENAME_OLD_NAME != 0
                && entry.reason & REASON_RENAME_NEW_NAME == 0
                && !is_delete;
            if is_old_rename_only {
                continue;
            }

            let old_node = self.nodes.get(&entry.frn).cloned();

            if is_delete {
                if old_node.as_ref().is_some_and(|n| n.is_directory) {
                    requires_full_rebuild = true;
                }
                self.nodes.remove(&entry.frn);
                self.remove_by_frn(entry.frn);
                continue;
            }

            self.nodes.insert(
                entry.frn,
                Node {
                    parent_frn: entry.parent_frn,
                    name: entry.name.clone(),
                    is_directory: entry.is_directory,
                },
            );

            if entry.is_directory {
                let unchanged = old_node.as_ref().is_some_and(|n| {
                    n.is_directory && n.parent_frn == entry.parent_frn && n.name == entry.name
                });
                if !unchanged {
                    requires_full_rebuild = true;
                }
                if !include_directories {
                    self.remove_by_frn(entry.frn);
                    continue;
                }
            }

            resolving.clear();
            let resolved = resolve_path(
                entry.frn,
                self.root_frn,
                &self.root_path,
                &self.nodes,
                &mut cache,
                &mut resolving,
            );
            match resolved {
                Some(path) if !path.is_empty() => {
                    self.upsert_file(entry.frn, &entry.name, path, entry.is_directory);
                }
                _ => self.remove_by_frn(entry.frn),
            }
        }

        if requires_full_rebuild {
            self.rebuild_from_nodes(include_directories);
        }
        self.files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: u64 = 5;

    fn node(parent: u64, name: &str, is_dir: bool) -> Node {
        Node {
            parent_frn: parent,
            name: name.to_string(),
            is_directory: is_dir,
        }
    }

    fn sample_nodes() -> NodeTable {
        let mut nodes = NodeTable::default();
        nodes.insert(ROOT, node(ROOT, "", true));
        nodes.insert(10, node(ROOT, "a.txt", false));
        nodes.insert(11, node(ROOT, "b.txt", false));
        nodes.insert(20, node(ROOT, "sub", true));
        nodes.insert(21, node(20, "c.txt", false));
        nodes
    }

    fn sample_index(include_directories: bool) -> VolumeIndex {
        let nodes = sample_nodes();
        let files =
            project_files(&nodes, ROOT, "C:\\", include_directories, &|| false).unwrap();
        let mut index = VolumeIndex {
            files,
            positions: FxHashMap::default(),
            nodes,
            root_frn: ROOT,
            root_path: "C:\\".to_string(),
        };
        index.rebuild_positions();
        index
    }

    fn record(frn: u64, parent: u64, name: &str, is_dir: bool, reason: u32) -> ChangeRecord {
        ChangeRecord {
            frn,
            parent_frn: parent,
            name: name.to_string(),
            is_directory: is_dir,
            reason,
        }
    }

    fn paths_sorted(index: &VolumeIndex) -> Vec<String> {
        let mut paths: Vec<String> = index.files.iter().map(|f| f.path.clone()).collect();
        paths.sort();
        paths
    }

    fn assert_positions_consistent(index: &VolumeIndex) {
        assert_eq!(index.positions.len(), index.files.len());
        for (i, file) in index.files.iter().enumerate() {
            assert_eq!(index.positions[&file.frn], i);
        }
    }

    #[test]
    fn extension_rules() {
        assert_eq!(extension_of("report.PDF", false), "pdf");
        assert_eq!(extension_of("archive.tar.gz", false), "gz");
        assert_eq!(extension_of("README", false), "");
        assert_eq!(extension_of(".gitignore", false), "");
        assert_eq!(extension_of("trailing.", false), "");
        assert_eq!(extension_of("photos.d", true), "");
    }

    #[test]
    fn projection_without_directories() {
        let index = sample_index(false);
        assert_eq!(
            paths_sorted(&index),
            vec!["C:\\a.txt", "C:\\b.txt", "C:\\sub\\c.txt"]
        );
        assert_positions_consistent(&index);
    }

    #[test]
    fn projection_with_directories() {
        let index = sample_index(true);
        assert_eq!(
            paths_sorted(&index),
            vec!["C:\\a.txt", "C:\\b.txt", "C:\\sub", "C:\\sub\\c.txt"]
        );
    }

    #[test]
    fn resolver_skips_parent_cycles() {
        let mut nodes = NodeTable::default();
        nodes.insert(ROOT, node(ROOT, "", true));
        nodes.insert(30, node(31, "x", true));
        nodes.insert(31, node(30, "y", true));
        nodes.insert(32, node(30, "z.txt", false));

        let mut cache = FxHashMap::default();
        cache.insert(ROOT, "C:\\".to_string());
        let mut resolving = FxHashSet::default();
        assert!(resolve_path(32, ROOT, "C:\\", &nodes, &mut cache, &mut resolving).is_none());
        // 环上的节点也不该污染缓存
        assert!(!cache.contains_key(&30));
    }

    #[test]
    fn resolver_skips_unknown_parent() {
        let mut nodes = NodeTable::default();
        nodes.insert(ROOT, node(ROOT, "", true));
        nodes.insert(40, node(999, "orphan.txt", false));

        let files = project_files(&nodes, ROOT, "C:\\", false, &|| false).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn rename_replay_keeps_frn() {
        let mut index = sample_index(false);

        let batch = vec![
            record(10, ROOT, "a.txt", false, REASON_RENAME_OLD_NAME),
            record(10, ROOT, "renamed.txt", false, REASON_RENAME_NEW_NAME),
        ];
        index.apply_change_batch(&batch, false);

        let paths = paths_sorted(&index);
        assert!(paths.contains(&"C:\\renamed.txt".to_string()));
        assert!(!paths.contains(&"C:\\a.txt".to_string()));
        assert_eq!(index.files.len(), 3);
        assert!(index.positions.contains_key(&10));
        assert_positions_consistent(&index);
    }

    #[test]
    fn old_rename_half_is_ignored() {
        let mut index = sample_index(false);
        let batch = vec![record(10, ROOT, "a.txt", false, REASON_RENAME_OLD_NAME)];
        index.apply_change_batch(&batch, false);
        assert!(paths_sorted(&index).contains(&"C:\\a.txt".to_string()));
    }

    #[test]
    fn file_delete_removes_entry() {
        let mut index = sample_index(false);
        let batch = vec![record(11, ROOT, "b.txt", false, REASON_FILE_DELETE)];
        index.apply_change_batch(&batch, false);

        assert_eq!(
            paths_sorted(&index),
            vec!["C:\\a.txt", "C:\\sub\\c.txt"]
        );
        assert!(!index.nodes.contains_key(&11));
        assert_positions_consistent(&index);
    }

    #[test]
    fn directory_delete_triggers_rebuild() {
        let mut index = sample_index(false);
        // 目录连同其中的文件一起被删除
        let batch = vec![
            record(21, 20, "c.txt", false, REASON_FILE_DELETE),
            record(20, ROOT, "sub", true, REASON_FILE_DELETE),
        ];
        index.apply_change_batch(&batch, false);

        assert_eq!(paths_sorted(&index), vec!["C:\\a.txt", "C:\\b.txt"]);
        assert_positions_consistent(&index);
    }

    #[test]
    fn directory_rename_rebuilds_descendant_paths() {
        let mut index = sample_index(false);
        let batch = vec![record(20, ROOT, "moved", true, REASON_RENAME_NEW_NAME)];
        index.apply_change_batch(&batch, false);

        assert_eq!(
            paths_sorted(&index),
            vec!["C:\\a.txt", "C:\\b.txt", "C:\\moved\\c.txt"]
        );
        assert_positions_consistent(&index);
    }

    #[test]
    fn new_file_is_upserted() {
        let mut index = sample_index(false);
        let batch = vec![record(33, 20, "new.log", false, 0x0000_0100)];
        let count = index.apply_change_batch(&batch, false);

        assert_eq!(count, 4);
        assert!(paths_sorted(&index).contains(&"C:\\sub\\new.log".to_string()));
        assert_positions_consistent(&index);
    }

    #[test]
    fn batch_matches_full_reprojection() {
        let mut incremental = sample_index(false);
        let batch = vec![
            record(33, 20, "new.log", false, 0x0000_0100),
            record(11, ROOT, "b.txt", false, REASON_FILE_DELETE),
            record(10, ROOT, "renamed.txt", false, REASON_RENAME_NEW_NAME),
        ];
        incremental.apply_change_batch(&batch, false);

        let reprojected =
            project_files(&incremental.nodes, ROOT, "C:\\", false, &|| false).unwrap();
        let mut expected: Vec<String> = reprojected.into_iter().map(|f| f.path).collect();
        expected.sort();
        assert_eq!(paths_sorted(&incremental), expected);
    }

    #[test]
    fn swap_remove_reregisters_tail() {
        let mut index = sample_index(false);
        let first_frn = index.files[0].frn;
        index.remove_by_frn(first_frn);
        assert_positions_consistent(&index);
        index.remove_by_frn(first_frn); // 再删一次应当无事发生
        assert_positions_consistent(&index);
    }
}
