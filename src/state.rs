//! 引擎全局状态
//!
//! 单进程只维护一份索引：枚举线程写入、监控线程增量更新、
//! 搜索与重复扫描只读。读写锁之外的开关和计数全部用原子量表达。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::LazyLock;

use parking_lot::{Mutex, RwLock};

use crate::index::{IndexSnapshot, IndexedFile, VolumeIndex};

/// 全局索引，单一读写锁保护节点表、索引视图和根信息
pub static INDEX: LazyLock<RwLock<VolumeIndex>> =
    LazyLock::new(|| RwLock::new(VolumeIndex::default()));

static LAST_ERROR: LazyLock<Mutex<String>> = LazyLock::new(|| Mutex::new(String::new()));

static IS_INDEXING: AtomicBool = AtomicBool::new(false);
static IS_READY: AtomicBool = AtomicBool::new(false);
static INDEXED_COUNT: AtomicU64 = AtomicU64::new(0);
static INCLUDE_DIRECTORIES: AtomicBool = AtomicBool::new(false);
static SCAN_ALL_DRIVES: AtomicBool = AtomicBool::new(false);

/// 枚举请求令牌：每次启动枚举自增，旧枚举发现不匹配即放弃
static INDEXING_TOKEN: AtomicU64 = AtomicU64::new(0);
/// 监控令牌：自增即让当前监控线程在下次检查时退出
static WATCHER_TOKEN: AtomicU64 = AtomicU64::new(0);

static DUP_RUNNING: AtomicBool = AtomicBool::new(false);
static DUP_CANCEL: AtomicBool = AtomicBool::new(false);
static DUP_DONE: AtomicU64 = AtomicU64::new(0);
static DUP_TOTAL: AtomicU64 = AtomicU64::new(0);
static DUP_GROUPS: AtomicU64 = AtomicU64::new(0);

pub fn set_last_error(text: impl Into<String>) {
    *LAST_ERROR.lock() = text.into();
}

pub fn last_error_text() -> String {
    LAST_ERROR.lock().clone()
}

pub fn set_indexing(value: bool) {
    IS_INDEXING.store(value, Ordering::Release);
}

pub fn is_indexing() -> bool {
    IS_INDEXING.load(Ordering::Acquire)
}

pub fn set_ready(value: bool) {
    IS_READY.store(value, Ordering::Release);
}

pub fn is_ready() -> bool {
    IS_READY.load(Ordering::Acquire)
}

pub fn set_indexed_count(value: u64) {
    INDEXED_COUNT.store(value, Ordering::Release);
}

pub fn indexed_count() -> u64 {
    INDEXED_COUNT.load(Ordering::Acquire)
}

pub fn set_include_directories(value: bool) {
    INCLUDE_DIRECTORIES.store(value, Ordering::Release);
}

pub fn include_directories() -> bool {
    INCLUDE_DIRECTORIES.load(Ordering::Acquire)
}

pub fn set_scan_all_drives_mode(value: bool) {
    SCAN_ALL_DRIVES.store(value, Ordering::Release);
}

pub fn scan_all_drives_mode() -> bool {
    SCAN_ALL_DRIVES.load(Ordering::Acquire)
}

/// 开始一次新的枚举请求，返回本次请求的令牌
pub fn begin_indexing_request() -> u64 {
    INDEXING_TOKEN.fetch_add(1, Ordering::AcqRel) + 1
}

/// 令牌为 0 表示一次性调用，不参与取消
pub fn indexing_cancelled(request_token: u64) -> bool {
    request_token != 0 && INDEXING_TOKEN.load(Ordering::Acquire) != request_token
}

pub fn stop_live_watcher() {
    WATCHER_TOKEN.fetch_add(1, Ordering::AcqRel);
}

pub fn begin_live_watcher() -> u64 {
    WATCHER_TOKEN.fetch_add(1, Ordering::AcqRel) + 1
}

pub fn watcher_cancelled(token: u64) -> bool {
    WATCHER_TOKEN.load(Ordering::Acquire) != token
}

// ==================== 重复扫描状态 ====================

/// 尝试占用重复扫描槽位，已有扫描在跑则返回 false
pub fn try_begin_duplicate_scan() -> bool {
    !DUP_RUNNING.swap(true, Ordering::AcqRel)
}

pub fn end_duplicate_scan() {
    DUP_RUNNING.store(false, Ordering::Release);
}

pub fn duplicate_scan_running() -> bool {
    DUP_RUNNING.load(Ordering::Acquire)
}

pub fn request_duplicate_cancel() {
    DUP_CANCEL.store(true, Ordering::Release);
}

pub fn clear_duplicate_cancel() {
    DUP_CANCEL.store(false, Ordering::Release);
}

pub fn duplicate_cancel_requested() -> bool {
    DUP_CANCEL.load(Ordering::Acquire)
}

pub fn reset_duplicate_progress() {
    DUP_DONE.store(0, Ordering::Release);
    DUP_TOTAL.store(0, Ordering::Release);
    DUP_GROUPS.store(0, Ordering::Release);
}

pub fn add_duplicate_total(units: u64) {
    if units > 0 {
        DUP_TOTAL.fetch_add(units, Ordering::AcqRel);
    }
}

pub fn add_duplicate_done(units: u64) {
    if units > 0 {
        DUP_DONE.fetch_add(units, Ordering::AcqRel);
    }
}

/// 完成时把 done 对齐到 total，保证进度能到 100%
pub fn snap_duplicate_done_to_total() {
    let total = DUP_TOTAL.load(Ordering::Acquire);
    DUP_DONE.store(total, Ordering::Release);
}

pub fn set_duplicate_groups_found(count: u64) {
    DUP_GROUPS.store(count, Ordering::Release);
}

/// 重复扫描状态 JSON，progressPercent 固定两位小数
pub fn duplicate_status_json() -> String {
    let running = DUP_RUNNING.load(Ordering::Acquire);
    let cancel_requested = DUP_CANCEL.load(Ordering::Acquire);
    let scanned = DUP_DONE.load(Ordering::Acquire);
    let total = DUP_TOTAL.load(Ordering::Acquire);
    let groups = DUP_GROUPS.load(Ordering::Acquire);
    let mut percent = if total > 0 {
        scanned as f64 * 100.0 / total as f64
    } else {
        0.0
    };
    if percent > 100.0 {
        percent = 100.0;
    }

    format!(
        "{{\"running\":{},\"cancelRequested\":{},\"scannedFiles\":{},\"totalFiles\":{},\"groupsFound\":{},\"progressPercent\":{:.2}}}",
        running, cancel_requested, scanned, total, groups, percent
    )
}

// ==================== 索引发布 ====================

/// 整体替换全局索引，读者要么看到旧快照要么看到新快照
pub fn publish_snapshot(snapshot: IndexSnapshot) -> u64 {
    let mut index = INDEX.write();
    index.files = snapshot.files;
    index.nodes = snapshot.nodes;
    index.root_frn = snapshot.root_frn;
    index.root_path = snapshot.root_path;
    index.rebuild_positions();
    let count = index.files.len() as u64;
    drop(index);
    set_indexed_count(count);
    count
}

/// 全盘模式只发布拼接后的文件序列，没有节点表也就没有增量更新
pub fn publish_files_only(files: Vec<IndexedFile>) -> u64 {
    let mut index = INDEX.write();
    index.files = files;
    index.nodes.clear();
    index.root_frn = 0;
    index.root_path.clear();
    index.rebuild_positions();
    let count = index.files.len() as u64;
    drop(index);
    set_indexed_count(count);
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_json_reports_two_decimal_percent() {
        reset_duplicate_progress();
        let json = duplicate_status_json();
        assert!(json.contains("\"progressPercent\":0.00"), "{json}");

        add_duplicate_total(3);
        add_duplicate_done(1);
        let json = duplicate_status_json();
        assert!(json.contains("\"progressPercent\":33.33"), "{json}");
        assert!(json.contains("\"scannedFiles\":1"));
        assert!(json.contains("\"totalFiles\":3"));
        reset_duplicate_progress();
    }

    #[test]
    fn indexing_token_supersedes_previous_request() {
        let first = begin_indexing_request();
        assert!(!indexing_cancelled(first));
        let second = begin_indexing_request();
        assert!(indexing_cancelled(first));
        assert!(!indexing_cancelled(second));
        assert!(!indexing_cancelled(0));
    }
}
