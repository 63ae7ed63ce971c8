//! NTFS 文件索引引擎 - Rust 实现
//!
//! 直接读 MFT 建立全卷内存索引，用 USN 日志保持增量同步，
//! 对宿主进程暴露一层扁平的 C ABI：字符串进出都是 UTF-8，
//! 返回的 JSON 由 `free_string` 配对释放。

pub mod drives;
pub mod dupes;
pub mod fsmeta;
pub mod index;
#[cfg(windows)]
pub mod mft;
pub mod records;
pub mod search;
pub mod state;
#[cfg(windows)]
pub mod watcher;

use std::cell::RefCell;
use std::ffi::{c_char, CStr, CString};
use std::panic::catch_unwind;

use crate::search::SearchQuery;

fn cstr_to_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

/// 堆上复制一份字符串交给宿主，由 free_string 回收
fn into_raw_string(value: String) -> *mut c_char {
    match CString::new(value) {
        Ok(raw) => raw.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

fn panic_to_null(context: &str) -> *mut c_char {
    state::set_last_error(format!("Engine panicked: {}.", context));
    std::ptr::null_mut()
}

// ==================== 索引 ====================

/// 启动一次后台枚举，立即返回是否受理。
///
/// 新请求会顶掉还在跑的枚举和监控线程。
#[no_mangle]
pub extern "C" fn start_indexing(
    drive_utf8: *const c_char,
    include_directories: bool,
    scan_all_drives: bool,
) -> bool {
    catch_unwind(|| {
        let drive = drives::normalize_drive_letter(&cstr_to_string(drive_utf8));
        let request_token = state::begin_indexing_request();
        state::set_indexing(true);
        state::set_ready(false);
        state::set_indexed_count(0);
        state::set_last_error("");
        state::stop_live_watcher();
        state::set_include_directories(include_directories);
        state::set_scan_all_drives_mode(scan_all_drives);

        let accepted: bool;
        #[cfg(windows)]
        {
            let options = mft::ScanOptions {
                drive,
                include_directories,
                scan_all_drives,
            };
            std::thread::spawn(move || mft::run_indexing(options, request_token));
            accepted = true;
        }
        #[cfg(not(windows))]
        {
            let _ = (drive, request_token);
            state::set_last_error("Indexing is only supported on Windows.");
            state::set_indexing(false);
            accepted = false;
        }
        accepted
    })
    .unwrap_or(false)
}

#[no_mangle]
pub extern "C" fn is_indexing() -> bool {
    state::is_indexing()
}

#[no_mangle]
pub extern "C" fn is_index_ready() -> bool {
    state::is_ready()
}

#[no_mangle]
pub extern "C" fn indexed_file_count() -> u64 {
    state::indexed_count()
}

thread_local! {
    /// last_error 的线程本地缓存，指针在本线程下次调用前有效
    static LAST_ERROR_CACHE: RefCell<CString> = RefCell::new(CString::default());
}

#[no_mangle]
pub extern "C" fn last_error() -> *const c_char {
    LAST_ERROR_CACHE.with(|cell| {
        let text = state::last_error_text();
        *cell.borrow_mut() = CString::new(text).unwrap_or_default();
        cell.borrow().as_ptr()
    })
}

// ==================== 查询 ====================

/// 列出所有逻辑驱动器及其文件系统信息
#[no_mangle]
pub extern "C" fn list_drives_json() -> *mut c_char {
    catch_unwind(|| match serde_json::to_string(&drives::list_drives()) {
        Ok(json) => into_raw_string(json),
        Err(_) => {
            state::set_last_error("Failed to serialize drive list.");
            std::ptr::null_mut()
        }
    })
    .unwrap_or_else(|_| panic_to_null("list_drives_json"))
}

/// 搜索索引。大小与时间参数用 0 / u64::MAX / i64::MIN / i64::MAX
/// 表示不限，limit 传 0 取默认 200。
#[no_mangle]
pub extern "C" fn search_files_json(
    query_utf8: *const c_char,
    extension_utf8: *const c_char,
    min_size: u64,
    max_size: u64,
    min_created_unix: i64,
    max_created_unix: i64,
    limit: u32,
) -> *mut c_char {
    catch_unwind(|| {
        let query = SearchQuery {
            query: cstr_to_string(query_utf8),
            extension: cstr_to_string(extension_utf8),
            min_size,
            max_size,
            min_created_unix,
            max_created_unix,
            limit,
        };
        let rows = search::search_files(&query);
        match serde_json::to_string(&rows) {
            Ok(json) => into_raw_string(json),
            Err(_) => {
                state::set_last_error("Failed to serialize search results.");
                std::ptr::null_mut()
            }
        }
    })
    .unwrap_or_else(|_| panic_to_null("search_files_json"))
}

/// 同步扫描一个卷，返回基本文件列表 JSON，不更新全局索引
#[no_mangle]
pub extern "C" fn scan_volume_json(drive_utf8: *const c_char) -> *mut c_char {
    catch_unwind(|| {
        let drive = drives::normalize_drive_letter(&cstr_to_string(drive_utf8));
        let out: *mut c_char;
        #[cfg(windows)]
        {
            out = match mft::scan_basic(drive) {
                Ok(rows) => match serde_json::to_string(&rows) {
                    Ok(json) => into_raw_string(json),
                    Err(_) => {
                        state::set_last_error("Failed to serialize scan results.");
                        std::ptr::null_mut()
                    }
                },
                Err(err) => {
                    state::set_last_error(err.to_string());
                    std::ptr::null_mut()
                }
            };
        }
        #[cfg(not(windows))]
        {
            let _ = drive;
            state::set_last_error("Volume scanning is only supported on Windows.");
            out = std::ptr::null_mut();
        }
        out
    })
    .unwrap_or_else(|_| panic_to_null("scan_volume_json"))
}

// ==================== 重复扫描 ====================

/// 同步执行重复文件扫描，可能耗时数分钟；失败或取消返回空指针，
/// 原因见 last_error。
#[no_mangle]
pub extern "C" fn find_duplicates_json(
    min_size: u64,
    max_groups: u32,
    max_files_per_group: u32,
) -> *mut c_char {
    catch_unwind(|| {
        match dupes::run_duplicate_scan(min_size, max_groups, max_files_per_group) {
            Ok(groups) => match serde_json::to_string(&groups) {
                Ok(json) => into_raw_string(json),
                Err(_) => {
                    state::set_last_error("Failed to serialize duplicate results.");
                    std::ptr::null_mut()
                }
            },
            Err(err) => {
                state::set_last_error(err.to_string());
                std::ptr::null_mut()
            }
        }
    })
    .unwrap_or_else(|_| panic_to_null("find_duplicates_json"))
}

/// 请求取消当前扫描，返回是否确实有扫描在跑
#[no_mangle]
pub extern "C" fn cancel_duplicate_scan() -> bool {
    if !state::duplicate_scan_running() {
        return false;
    }
    state::request_duplicate_cancel();
    true
}

#[no_mangle]
pub extern "C" fn duplicate_scan_status_json() -> *mut c_char {
    catch_unwind(|| into_raw_string(state::duplicate_status_json()))
        .unwrap_or_else(|_| panic_to_null("duplicate_scan_status_json"))
}

// ==================== 内存管理 ====================

/// 释放任何由本引擎返回的字符串
#[no_mangle]
pub extern "C" fn free_string(value: *mut c_char) {
    if !value.is_null() {
        unsafe {
            drop(CString::from_raw(value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_string_round_trip() {
        let raw = into_raw_string("{\"ok\":true}".to_string());
        assert!(!raw.is_null());
        let text = unsafe { CStr::from_ptr(raw) }.to_str().unwrap().to_string();
        assert_eq!(text, "{\"ok\":true}");
        free_string(raw);
    }

    #[test]
    fn null_inputs_fall_back_to_defaults() {
        assert_eq!(cstr_to_string(std::ptr::null()), "");
        assert_eq!(drives::normalize_drive_letter(""), 'C');
    }
}
