//! 搜索求值器
//!
//! 在共享读锁下线性扫描索引视图，过滤条件全部取交集。
//! 命中项逐个读取元数据，已失效的条目直接丢弃。

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::fsmeta::{is_missing_path_code, read_file_metadata};
use crate::index::VolumeIndex;
use crate::state;

const DEFAULT_LIMIT: u32 = 200;
const MAX_LIMIT: u32 = 5_000;

/// 一条搜索命中
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRow {
    pub name: String,
    pub path: String,
    pub extension: String,
    pub size: u64,
    pub created_unix: i64,
    pub modified_unix: i64,
    pub is_directory: bool,
}

/// 搜索参数，0 / u64::MAX / i64::MIN / i64::MAX 表示对应边界不限
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: String,
    pub extension: String,
    pub min_size: u64,
    pub max_size: u64,
    pub min_created_unix: i64,
    pub max_created_unix: i64,
    pub limit: u32,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            query: String::new(),
            extension: String::new(),
            min_size: 0,
            max_size: u64::MAX,
            min_created_unix: i64::MIN,
            max_created_unix: i64::MAX,
            limit: DEFAULT_LIMIT,
        }
    }
}

/// 扩展名过滤器归一化：去掉前导点并转小写
fn normalize_extension_filter(raw: &str) -> String {
    raw.trim_start_matches('.').to_lowercase()
}

/// `folder` 等关键字表示只要目录
fn extension_targets_directories(filter: &str) -> bool {
    matches!(filter, "folder" | "folders" | "dir" | "directory")
}

/// 全盘分发模式的桶键：盘符、UNC 归 `#`、其余归 `?`
pub fn drive_bucket_key(path: &str) -> char {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' {
        let letter = bytes[0].to_ascii_uppercase();
        if letter.is_ascii_uppercase() {
            return letter as char;
        }
    }
    if path.starts_with("\\\\") {
        return '#';
    }
    '?'
}

/// 按首次出现的桶顺序做轮询合并，直到凑满 limit 或桶都取空
fn assemble_round_robin(
    mut buckets: FxHashMap<char, Vec<SearchRow>>,
    order: &[char],
    limit: usize,
) -> Vec<SearchRow> {
    let mut cursors: Vec<std::vec::IntoIter<SearchRow>> = order
        .iter()
        .map(|key| buckets.remove(key).unwrap_or_default().into_iter())
        .collect();

    let mut rows = Vec::with_capacity(limit);
    let mut appended = true;
    while rows.len() < limit && appended {
        appended = false;
        for cursor in cursors.iter_mut() {
            let Some(row) = cursor.next() else {
                continue;
            };
            rows.push(row);
            appended = true;
            if rows.len() >= limit {
                break;
            }
        }
    }
    rows
}

/// 对给定索引求值。`all_drives_index` 为真表示当前索引来自全盘扫描。
pub fn evaluate(index: &VolumeIndex, all_drives_index: bool, query: &SearchQuery) -> Vec<SearchRow> {
    let limit = match query.limit {
        0 => DEFAULT_LIMIT,
        n => n.min(MAX_LIMIT),
    } as usize;

    let needle = query.query.to_lowercase();
    let extension_filter = normalize_extension_filter(&query.extension);
    let has_extension_filter = !extension_filter.is_empty();
    let directories_only = extension_targets_directories(&extension_filter);
    let has_size_filter = query.min_size > 0 || query.max_size < u64::MAX;
    let has_date_filter =
        query.min_created_unix > i64::MIN || query.max_created_unix < i64::MAX;
    let requires_metadata = has_size_filter || has_date_filter;
    let distribute = all_drives_index
        && limit > 1
        && needle.is_empty()
        && (has_extension_filter || has_size_filter || has_date_filter);

    let mut rows: Vec<SearchRow> = Vec::with_capacity(limit.min(1024));
    let mut buckets: FxHashMap<char, Vec<SearchRow>> = FxHashMap::default();
    let mut bucket_order: Vec<char> = Vec::new();

    for file in &index.files {
        if !needle.is_empty() && !file.path.to_lowercase().contains(&needle) {
            continue;
        }
        if has_extension_filter {
            if directories_only {
                if !file.is_directory {
                    continue;
                }
            } else if file.is_directory || file.extension != extension_filter {
                continue;
            }
        }

        let metadata = match read_file_metadata(&file.path) {
            Ok(meta) => Some(meta),
            Err(err) => {
                if is_missing_path_code(err.raw_os_error().unwrap_or(0)) {
                    // 索引里残留的过期条目，静默跳过
                    continue;
                }
                None
            }
        };

        if requires_metadata {
            let Some(meta) = metadata else {
                continue;
            };
            if meta.size < query.min_size || meta.size > query.max_size {
                continue;
            }
            if meta.created_unix < query.min_created_unix
                || meta.created_unix > query.max_created_unix
            {
                continue;
            }
        }

        let meta = metadata.unwrap_or_default();
        let row = SearchRow {
            name: file.name.clone(),
            path: file.path.clone(),
            extension: file.extension.clone(),
            size: meta.size,
            created_unix: meta.created_unix,
            modified_unix: meta.modified_unix,
            is_directory: file.is_directory,
        };

        if distribute {
            let key = drive_bucket_key(&file.path);
            let bucket = buckets.entry(key).or_insert_with(|| {
                bucket_order.push(key);
                Vec::with_capacity(128)
            });
            bucket.push(row);
        } else {
            rows.push(row);
            if rows.len() >= limit {
                break;
            }
        }
    }

    if distribute {
        rows = assemble_round_robin(buckets, &bucket_order, limit);
    }
    rows
}

/// 对全局索引执行一次查询，整个扫描期间持有共享读锁
pub fn search_files(query: &SearchQuery) -> Vec<SearchRow> {
    let index = state::INDEX.read();
    evaluate(&index, state::scan_all_drives_mode(), query)
}
