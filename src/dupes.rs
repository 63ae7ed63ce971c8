//! 重复文件扫描引擎
//!
//! 按大小分桶后三级收窄：快速签名（首尾块）、全文件哈希、逐字节校验。
//! 哈希用 FNV-1a-64，非加密，最终一致性由逐字节校验兜底。

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use anyhow::{anyhow, Result};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::fsmeta::read_file_metadata;
use crate::index::IndexedFile;
use crate::state;

/// min_size 传 0 时的默认阈值
const DEFAULT_MIN_SIZE: u64 = 1024 * 1024;
/// 顺序读取块大小（全文件哈希、逐字节比较）
const SEQUENTIAL_CHUNK: usize = 1024 * 1024;
/// 随机读取块大小（快速签名的首尾块）
const QUICK_CHUNK: usize = 64 * 1024;

const MAX_GROUPS_CAP: u32 = 1_000;
const MIN_FILES_PER_GROUP: u32 = 2;
const MAX_FILES_PER_GROUP_CAP: u32 = 400;

pub const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 重复组里的一个成员
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateFileRow {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub created_unix: i64,
    pub modified_unix: i64,
}

/// 一组校验通过的重复文件
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateGroupRow {
    pub group_id: String,
    pub size: u64,
    pub total_bytes: u64,
    pub file_count: u32,
    pub files: Vec<DuplicateFileRow>,
}

/// 增量 FNV-1a-64
pub struct Fnv64 {
    hash: u64,
}

impl Fnv64 {
    pub fn new() -> Self {
        Self {
            hash: FNV_OFFSET_BASIS,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.hash ^= u64::from(byte);
            self.hash = self.hash.wrapping_mul(FNV_PRIME);
        }
    }

    pub fn finish(&self) -> u64 {
        self.hash
    }
}

impl Default for Fnv64 {
    fn default() -> Self {
        Self::new()
    }
}

/// 每个工作线程复用的读取缓冲
thread_local! {
    static SEQUENTIAL_BUF: RefCell<Vec<u8>> = RefCell::new(vec![0u8; SEQUENTIAL_CHUNK]);
    static QUICK_BUF: RefCell<Vec<u8>> = RefCell::new(vec![0u8; QUICK_CHUNK]);
    static COMPARE_BUFS: RefCell<(Vec<u8>, Vec<u8>)> =
        RefCell::new((vec![0u8; SEQUENTIAL_CHUNK], vec![0u8; SEQUENTIAL_CHUNK]));
}

fn cancel_requested() -> bool {
    state::duplicate_cancel_requested()
}

/// 反复 read 直到填满缓冲或遇到 EOF，返回实际读到的字节数
fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// 快速签名：大小 + 首 64 KiB + 尾 64 KiB。
///
/// 文件不足 64 KiB 时首块已覆盖全文，不再读尾块。
pub fn quick_signature(file: &DuplicateFileRow) -> Option<u64> {
    if cancel_requested() {
        return None;
    }

    let mut fnv = Fnv64::new();
    fnv.update(&file.size.to_le_bytes());
    if file.size == 0 {
        return Some(fnv.finish());
    }

    let mut handle = File::open(&file.path).ok()?;
    QUICK_BUF.with(|cell| {
        let mut buf = cell.borrow_mut();
        let head_len = file.size.min(QUICK_CHUNK as u64) as usize;
        let read = read_full(&mut handle, &mut buf[..head_len]).ok()?;
        if read != head_len {
            return None;
        }
        fnv.update(&buf[..head_len]);

        if file.size > head_len as u64 {
            if cancel_requested() {
                return None;
            }
            let tail_len = file.size.min(QUICK_CHUNK as u64) as usize;
            handle
                .seek(SeekFrom::Start(file.size - tail_len as u64))
                .ok()?;
            let read = read_full(&mut handle, &mut buf[..tail_len]).ok()?;
            if read != tail_len {
                return None;
            }
            fnv.update(&buf[..tail_len]);
        }
        Some(fnv.finish())
    })
}

/// 全文件 FNV-1a-64
pub fn full_hash(file: &DuplicateFileRow) -> Option<u64> {
    if cancel_requested() {
        return None;
    }

    let mut handle = File::open(&file.path).ok()?;
    SEQUENTIAL_BUF.with(|cell| {
        let mut buf = cell.borrow_mut();
        let mut fnv = Fnv64::new();
        loop {
            if cancel_requested() {
                return None;
            }
            let n = handle.read(&mut buf[..]).ok()?;
            if n == 0 {
                break;
            }
            fnv.update(&buf[..n]);
        }
        Some(fnv.finish())
    })
}

/// 逐字节比较两个文件，任何读失败或取消都按不相等处理
pub fn files_byte_equal(left_path: &str, right_path: &str) -> bool {
    if cancel_requested() {
        return false;
    }

    let Ok(mut left) = File::open(left_path) else {
        return false;
    };
    let Ok(mut right) = File::open(right_path) else {
        return false;
    };

    COMPARE_BUFS.with(|cell| {
        let mut bufs = cell.borrow_mut();
        let (left_buf, right_buf) = &mut *bufs;
        loop {
            if cancel_requested() {
                return false;
            }
            let (Ok(left_read), Ok(right_read)) = (
                read_full(&mut left, left_buf),
                read_full(&mut right, right_buf),
            ) else {
                return false;
            };
            if left_read != right_read {
                return false;
            }
            if left_read == 0 {
                return true;
            }
            if left_buf[..left_read] != right_buf[..right_read] {
                return false;
            }
        }
    })
}

/// 并行哈希一批文件，取消后剩余项返回 None
fn hash_files_parallel<F>(files: &[DuplicateFileRow], hash_fn: F, track_progress: bool) -> Vec<Option<u64>>
where
    F: Fn(&DuplicateFileRow) -> Option<u64> + Sync,
{
    files
        .par_iter()
        .map(|file| {
            if cancel_requested() {
                return None;
            }
            let hash = hash_fn(file);
            if track_progress {
                state::add_duplicate_done(1);
            }
            hash
        })
        .collect()
}

fn build_group_id(size: u64, hash_value: u64, serial: u32) -> String {
    format!("{size:016x}-{hash_value:016x}-{serial:08x}")
}

fn emit_group(
    size: u64,
    hash_value: u64,
    serial: &mut u32,
    members: &[&DuplicateFileRow],
    max_files_per_group: usize,
) -> DuplicateGroupRow {
    let group_id = build_group_id(size, hash_value, *serial);
    *serial += 1;
    let files: Vec<DuplicateFileRow> = members
        .iter()
        .take(max_files_per_group)
        .map(|row| (*row).clone())
        .collect();
    DuplicateGroupRow {
        group_id,
        size,
        total_bytes: size * members.len() as u64,
        file_count: members.len() as u32,
        files,
    }
}

/// 可回收字节数降序，持平时成员数降序
fn sort_groups(groups: &mut [DuplicateGroupRow]) {
    groups.sort_by(|left, right| {
        let left_reclaim = left.size * u64::from(left.file_count.saturating_sub(1));
        let right_reclaim = right.size * u64::from(right.file_count.saturating_sub(1));
        right_reclaim
            .cmp(&left_reclaim)
            .then(right.file_count.cmp(&left.file_count))
    });
}

/// 对一份索引快照执行完整的重复检测流水线。
///
/// 进度与取消通过全局状态交互；取消时返回的分组无意义，调用方负责丢弃。
pub fn scan_snapshot(
    snapshot: &[IndexedFile],
    min_size: u64,
    max_groups: usize,
    max_files_per_group: usize,
) -> Vec<DuplicateGroupRow> {
    let mut groups: Vec<DuplicateGroupRow> = Vec::with_capacity(128);
    let mut group_serial: u32 = 0;

    state::add_duplicate_total(snapshot.len() as u64);

    'scan: {
        // 元数据扫描：丢弃目录和低于阈值的文件
        let survivors: Vec<Option<DuplicateFileRow>> = snapshot
            .par_iter()
            .map(|file| {
                if cancel_requested() {
                    return None;
                }
                if file.is_directory {
                    state::add_duplicate_done(1);
                    return None;
                }
                let row = match read_file_metadata(&file.path) {
                    Ok(meta) if meta.size >= min_size => Some(DuplicateFileRow {
                        name: file.name.clone(),
                        path: file.path.clone(),
                        size: meta.size,
                        created_unix: meta.created_unix,
                        modified_unix: meta.modified_unix,
                    }),
                    _ => None,
                };
                state::add_duplicate_done(1);
                row
            })
            .collect();
        if cancel_requested() {
            break 'scan;
        }

        // 按精确大小分桶，单元素桶直接丢弃
        let mut size_buckets: FxHashMap<u64, Vec<DuplicateFileRow>> = FxHashMap::default();
        for row in survivors.into_iter().flatten() {
            if cancel_requested() {
                break 'scan;
            }
            size_buckets.entry(row.size).or_default().push(row);
        }

        for (file_size, files) in size_buckets {
            if cancel_requested() {
                break 'scan;
            }
            if files.len() < 2 {
                continue;
            }

            // 空文件内容必然一致，整桶成组且零磁盘读取
            if file_size == 0 {
                let members: Vec<&DuplicateFileRow> = files.iter().collect();
                groups.push(emit_group(0, 0, &mut group_serial, &members, max_files_per_group));
                state::set_duplicate_groups_found(groups.len() as u64);
                if groups.len() >= max_groups {
                    break 'scan;
                }
                continue;
            }

            // 快速签名
            state::add_duplicate_total(files.len() as u64);
            let signatures = hash_files_parallel(&files, quick_signature, true);
            if cancel_requested() {
                break 'scan;
            }

            let mut quick_buckets: FxHashMap<u64, Vec<usize>> = FxHashMap::default();
            for (i, signature) in signatures.iter().enumerate() {
                if let Some(signature) = signature {
                    quick_buckets.entry(*signature).or_default().push(i);
                }
            }

            for (_, quick_indices) in quick_buckets {
                if quick_indices.len() < 2 {
                    continue;
                }
                let candidates: Vec<DuplicateFileRow> =
                    quick_indices.iter().map(|&i| files[i].clone()).collect();

                // 签名撞上的才做全文件哈希
                state::add_duplicate_total(candidates.len() as u64);
                let hashes = hash_files_parallel(&candidates, full_hash, true);
                if cancel_requested() {
                    break 'scan;
                }

                let mut hash_buckets: FxHashMap<u64, Vec<usize>> = FxHashMap::default();
                for (i, hash) in hashes.iter().enumerate() {
                    if let Some(hash) = hash {
                        hash_buckets.entry(*hash).or_default().push(i);
                    }
                }

                for (hash_value, candidate_indices) in hash_buckets {
                    if candidate_indices.len() < 2 {
                        continue;
                    }

                    // 逐字节校验：与已有簇代表比对，不匹配就另起一簇
                    let mut clusters: Vec<Vec<usize>> = Vec::new();
                    for &candidate in &candidate_indices {
                        let mut matched = false;
                        for cluster in clusters.iter_mut() {
                            let representative = cluster[0];
                            if files_byte_equal(
                                &candidates[candidate].path,
                                &candidates[representative].path,
                            ) {
                                cluster.push(candidate);
                                matched = true;
                                break;
                            }
                        }
                        if !matched {
                            clusters.push(vec![candidate]);
                        }
                    }

                    for cluster in clusters {
                        if cluster.len() < 2 {
                            continue;
                        }
                        let members: Vec<&DuplicateFileRow> =
                            cluster.iter().map(|&i| &candidates[i]).collect();
                        groups.push(emit_group(
                            file_size,
                            hash_value,
                            &mut group_serial,
                            &members,
                            max_files_per_group,
                        ));
                        state::set_duplicate_groups_found(groups.len() as u64);
                        if groups.len() >= max_groups {
                            break 'scan;
                        }
                    }
                }
            }
        }
    }

    if !cancel_requested() {
        state::snap_duplicate_done_to_total();
    }
    sort_groups(&mut groups);
    groups
}

/// 执行一次完整的重复扫描：前置检查、参数钳制、快照、流水线。
///
/// 索引未就绪或已有扫描在跑时报错；被取消时同样以错误返回，不给部分结果。
pub fn run_duplicate_scan(
    min_size: u64,
    max_groups: u32,
    max_files_per_group: u32,
) -> Result<Vec<DuplicateGroupRow>> {
    if !state::is_ready() {
        return Err(anyhow!("Index is not ready yet. Wait for indexing to finish."));
    }
    if !state::try_begin_duplicate_scan() {
        return Err(anyhow!("Duplicate scan is already running."));
    }

    state::clear_duplicate_cancel();
    state::reset_duplicate_progress();

    let min_size = if min_size == 0 { DEFAULT_MIN_SIZE } else { min_size };
    let max_groups = max_groups.clamp(1, MAX_GROUPS_CAP) as usize;
    let max_files_per_group =
        max_files_per_group.clamp(MIN_FILES_PER_GROUP, MAX_FILES_PER_GROUP_CAP) as usize;

    let snapshot: Vec<IndexedFile> = state::INDEX.read().files.clone();
    log::info!(
        "重复扫描开始: {} 个索引项, min_size={}",
        snapshot.len(),
        min_size
    );
    let groups = scan_snapshot(&snapshot, min_size, max_groups, max_files_per_group);

    let cancelled = state::duplicate_cancel_requested();
    state::end_duplicate_scan();
    state::clear_duplicate_cancel();

    if cancelled {
        log::info!("重复扫描被取消");
        return Err(anyhow!("Duplicate scan cancelled."));
    }
    log::info!("重复扫描完成: {} 组", groups.len());
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> DuplicateFileRow {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        DuplicateFileRow {
            name: name.to_string(),
            path: path.to_string_lossy().into_owned(),
            size: contents.len() as u64,
            created_unix: 0,
            modified_unix: 0,
        }
    }

    #[test]
    fn fnv_empty_input_is_offset_basis() {
        assert_eq!(Fnv64::new().finish(), 0xcbf29ce484222325);
    }

    #[test]
    fn fnv_reference_values() {
        let mut fnv = Fnv64::new();
        fnv.update(b"hello");
        assert_eq!(fnv.finish(), 0xa430d84680aabd0b);
    }

    #[test]
    fn group_id_is_hex_triplet() {
        assert_eq!(
            build_group_id(0x1000, 0xdead_beef, 7),
            "0000000000001000-00000000deadbeef-00000007"
        );
    }

    #[test]
    fn quick_signature_ignores_middle_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let len = 200 * 1024;
        let mut a = vec![0u8; len];
        let mut b = vec![0u8; len];
        a[len / 2] = 1;
        b[len / 2] = 2;
        let row_a = write_file(dir.path(), "a.bin", &a);
        let row_b = write_file(dir.path(), "b.bin", &b);

        // 中段不同但首尾一致：快速签名相同，全文件哈希不同
        assert_eq!(quick_signature(&row_a), quick_signature(&row_b));
        assert_ne!(full_hash(&row_a), full_hash(&row_b));
        assert!(!files_byte_equal(&row_a.path, &row_b.path));
    }

    #[test]
    fn quick_signature_of_small_file_covers_whole_content() {
        let dir = tempfile::tempdir().unwrap();
        let row_a = write_file(dir.path(), "small_a.bin", b"identical payload");
        let row_b = write_file(dir.path(), "small_b.bin", b"identical payload");
        let row_c = write_file(dir.path(), "small_c.bin", b"different payload");

        assert_eq!(quick_signature(&row_a), quick_signature(&row_b));
        assert_ne!(quick_signature(&row_a), quick_signature(&row_c));
    }

    #[test]
    fn quick_signature_includes_size() {
        let dir = tempfile::tempdir().unwrap();
        // 同为空内容前缀但长度不同，签名必须不同
        let row_a = write_file(dir.path(), "len1.bin", &[0u8; 1]);
        let row_b = write_file(dir.path(), "len2.bin", &[0u8; 2]);
        assert_ne!(quick_signature(&row_a), quick_signature(&row_b));
    }

    #[test]
    fn byte_equal_detects_equality_and_difference() {
        let dir = tempfile::tempdir().unwrap();
        let row_a = write_file(dir.path(), "x.bin", &[7u8; 4096]);
        let row_b = write_file(dir.path(), "y.bin", &[7u8; 4096]);
        let row_c = write_file(dir.path(), "z.bin", &[8u8; 4096]);

        assert!(files_byte_equal(&row_a.path, &row_b.path));
        assert!(!files_byte_equal(&row_a.path, &row_c.path));
        assert!(!files_byte_equal(&row_a.path, "no/such/file.bin"));
    }

    #[test]
    fn sorting_prefers_reclaimable_bytes_then_count() {
        let group = |size: u64, count: u32| DuplicateGroupRow {
            group_id: build_group_id(size, 0, 0),
            size,
            total_bytes: size * u64::from(count),
            file_count: count,
            files: Vec::new(),
        };
        let mut groups = vec![group(10, 2), group(100, 3), group(100, 2), group(200, 2)];
        sort_groups(&mut groups);
        let order: Vec<(u64, u32)> = groups.iter().map(|g| (g.size, g.file_count)).collect();
        // 可回收: 200, 200, 100, 10；两个 200 按成员数排序
        assert_eq!(order, vec![(100, 3), (200, 2), (100, 2), (10, 2)]);
    }
}
