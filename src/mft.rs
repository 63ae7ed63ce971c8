//! MFT 扫描与枚举驱动（仅 Windows）
//!
//! 通过 `\\.\X:` 原始卷句柄批量拉取 MFT 记录，构建节点表并投影成
//! 索引视图。需要管理员权限和 NTFS 卷。

use std::ffi::c_void;
use std::mem::size_of;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, GENERIC_READ, HANDLE};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, GetFileInformationByHandle, BY_HANDLE_FILE_INFORMATION, FILE_ATTRIBUTE_NORMAL,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_READ_ATTRIBUTES, FILE_SHARE_DELETE, FILE_SHARE_READ,
    FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::System::IO::DeviceIoControl;

use crate::drives;
use crate::index::{self, IndexSnapshot, IndexedFile, Node, NodeTable};
use crate::records;
use crate::state;
use crate::watcher;

pub(crate) const FSCTL_ENUM_USN_DATA: u32 = 0x0009_00b3;
pub(crate) const FSCTL_READ_USN_JOURNAL: u32 = 0x0009_00bb;
pub(crate) const FSCTL_CREATE_USN_JOURNAL: u32 = 0x0009_00e7;
pub(crate) const FSCTL_QUERY_USN_JOURNAL: u32 = 0x0009_00f4;

pub(crate) const ERROR_FILE_NOT_FOUND: u32 = 2;
pub(crate) const ERROR_HANDLE_EOF: u32 = 38;
pub(crate) const ERROR_INVALID_PARAMETER: u32 = 87;
pub(crate) const ERROR_JOURNAL_DELETE_IN_PROGRESS: u32 = 1178;
pub(crate) const ERROR_JOURNAL_NOT_ACTIVE: u32 = 1179;
pub(crate) const ERROR_JOURNAL_ENTRY_DELETED: u32 = 1181;

/// 每次 FSCTL_ENUM_USN_DATA 的输出缓冲
const ENUM_BUFFER_SIZE: usize = 4 * 1024 * 1024;
/// 新建日志的参数：最大 32 MiB，分配增量 8 MiB
const JOURNAL_MAXIMUM_SIZE: u64 = 32 * 1024 * 1024;
const JOURNAL_ALLOCATION_DELTA: u64 = 8 * 1024 * 1024;

/// 一次索引请求的参数
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScanOptions {
    pub drive: char,
    pub include_directories: bool,
    pub scan_all_drives: bool,
}

/// 枚举结果：完成或被新请求取代
pub enum ScanOutcome {
    Complete(IndexSnapshot),
    Cancelled,
}

/// USN_JOURNAL_DATA_V0
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct UsnJournalData {
    pub usn_journal_id: u64,
    pub first_usn: i64,
    pub next_usn: i64,
    pub lowest_valid_usn: i64,
    pub max_usn: i64,
    pub maximum_size: u64,
    pub allocation_delta: u64,
}

/// MFT_ENUM_DATA_V0
#[repr(C)]
pub struct MftEnumData {
    pub start_file_reference_number: u64,
    pub low_usn: i64,
    pub high_usn: i64,
}

/// CREATE_USN_JOURNAL_DATA
#[repr(C)]
pub struct CreateUsnJournalData {
    pub maximum_size: u64,
    pub allocation_delta: u64,
}

/// 卷句柄守卫，任何退出路径都关闭句柄
pub(crate) struct VolumeHandle(pub HANDLE);

impl Drop for VolumeHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

pub(crate) fn to_wide(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(std::iter::once(0)).collect()
}

/// 从 windows 错误里取 Win32 错误码
pub(crate) fn win32_code(error: &windows::core::Error) -> u32 {
    (error.code().0 & 0xFFFF) as u32
}

/// 拼出「上下文 (0x码 系统消息)」形式的错误文本
pub(crate) fn win32_error_text(context: &str, error: &windows::core::Error) -> String {
    let message = error.message();
    format!("{} (0x{:08X} {})", context, win32_code(error), message.trim())
}

fn is_journal_missing_code(code: u32) -> bool {
    matches!(
        code,
        ERROR_JOURNAL_NOT_ACTIVE | ERROR_JOURNAL_DELETE_IN_PROGRESS | ERROR_FILE_NOT_FOUND
    )
}

/// 以共享读写删打开原始卷设备
pub(crate) fn open_volume(drive: char) -> std::result::Result<VolumeHandle, windows::core::Error> {
    let path = to_wide(&format!("\\\\.\\{}:", drive));
    let handle = unsafe {
        CreateFileW(
            PCWSTR(path.as_ptr()),
            GENERIC_READ.0,
            FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
            None,
            OPEN_EXISTING,
            FILE_ATTRIBUTE_NORMAL,
            None,
        )?
    };
    Ok(VolumeHandle(handle))
}

/// DeviceIoControl 包装，返回写入输出缓冲的字节数
pub(crate) fn vol_ioctl(
    handle: HANDLE,
    control_code: u32,
    input: Option<(*const c_void, u32)>,
    output: Option<(*mut c_void, u32)>,
) -> std::result::Result<u32, windows::core::Error> {
    let mut returned = 0u32;
    let (in_ptr, in_len) = match input {
        Some((ptr, len)) => (Some(ptr), len),
        None => (None, 0),
    };
    let (out_ptr, out_len) = match output {
        Some((ptr, len)) => (Some(ptr), len),
        None => (None, 0),
    };
    unsafe {
        DeviceIoControl(
            handle,
            control_code,
            in_ptr,
            in_len,
            out_ptr,
            out_len,
            Some(&mut returned),
            None,
        )?;
    }
    Ok(returned)
}

/// 取卷根目录的 FRN，作为路径解析的终点
fn root_frn_of(root_path: &str) -> Result<u64> {
    let wide = to_wide(root_path);
    let handle = unsafe {
        CreateFileW(
            PCWSTR(wide.as_ptr()),
            FILE_READ_ATTRIBUTES.0,
            FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
            None,
            OPEN_EXISTING,
            FILE_FLAG_BACKUP_SEMANTICS,
            None,
        )
    }
    .map_err(|_| anyhow!("Failed to open drive root handle."))?;
    let root = VolumeHandle(handle);

    let mut info = BY_HANDLE_FILE_INFORMATION::default();
    unsafe { GetFileInformationByHandle(root.0, &mut info) }
        .map_err(|_| anyhow!("Failed to read root file reference number."))?;
    Ok((u64::from(info.nFileIndexHigh) << 32) | u64::from(info.nFileIndexLow))
}

fn query_journal_raw(volume: HANDLE) -> std::result::Result<UsnJournalData, windows::core::Error> {
    let mut data = UsnJournalData::default();
    vol_ioctl(
        volume,
        FSCTL_QUERY_USN_JOURNAL,
        None,
        Some((
            &mut data as *mut UsnJournalData as *mut c_void,
            size_of::<UsnJournalData>() as u32,
        )),
    )?;
    Ok(data)
}

/// 查询日志；不存在时尝试建一份再查。
///
/// 返回 Ok(None) 表示确实没有可用日志，枚举照常进行但没有实时更新。
fn query_journal(volume: HANDLE) -> Result<Option<UsnJournalData>> {
    match query_journal_raw(volume) {
        Ok(data) => Ok(Some(data)),
        Err(err) => {
            if !is_journal_missing_code(win32_code(&err)) {
                return Err(anyhow!(win32_error_text("Failed to query USN journal.", &err)));
            }
            let create = CreateUsnJournalData {
                maximum_size: JOURNAL_MAXIMUM_SIZE,
                allocation_delta: JOURNAL_ALLOCATION_DELTA,
            };
            let _ = vol_ioctl(
                volume,
                FSCTL_CREATE_USN_JOURNAL,
                Some((
                    &create as *const CreateUsnJournalData as *const c_void,
                    size_of::<CreateUsnJournalData>() as u32,
                )),
                None,
            );
            match query_journal_raw(volume) {
                Ok(data) => Ok(Some(data)),
                Err(_) => Ok(None),
            }
        }
    }
}

/// 对单个卷做一次完整枚举
pub fn scan_volume(
    drive: char,
    include_directories: bool,
    request_token: u64,
) -> Result<ScanOutcome> {
    let root_path = format!("{}:\\", drive);
    let volume = open_volume(drive).map_err(|err| {
        anyhow!(win32_error_text(
            "Unable to open volume. Run as administrator and ensure the target drive is NTFS.",
            &err,
        ))
    })?;
    let root_frn = root_frn_of(&root_path)?;

    let journal = query_journal(volume.0)?;
    let high_usn = journal.as_ref().map_or(i64::MAX, |j| j.next_usn);

    let mut enum_data = MftEnumData {
        start_file_reference_number: 0,
        low_usn: 0,
        high_usn,
    };
    let mut buffer = vec![0u8; ENUM_BUFFER_SIZE];
    let mut nodes = NodeTable::with_capacity_and_hasher(500_000, Default::default());
    let mut discovered_files: u64 = 0;

    loop {
        if state::indexing_cancelled(request_token) {
            return Ok(ScanOutcome::Cancelled);
        }

        let returned = match vol_ioctl(
            volume.0,
            FSCTL_ENUM_USN_DATA,
            Some((
                &enum_data as *const MftEnumData as *const c_void,
                size_of::<MftEnumData>() as u32,
            )),
            Some((buffer.as_mut_ptr() as *mut c_void, ENUM_BUFFER_SIZE as u32)),
        ) {
            Ok(n) => n as usize,
            Err(err) => {
                if win32_code(&err) == ERROR_HANDLE_EOF {
                    break;
                }
                return Err(anyhow!(win32_error_text(
                    "MFT enumeration failed during DeviceIoControl call.",
                    &err,
                )));
            }
        };
        if returned <= 8 {
            break;
        }

        // 缓冲区前 8 字节是下一轮的起始 FRN
        enum_data.start_file_reference_number =
            u64::from_le_bytes(buffer[0..8].try_into().unwrap());

        for entry in records::walk_records(&buffer[8..returned]) {
            let is_directory = entry.is_directory;
            nodes.insert(
                entry.frn,
                Node {
                    parent_frn: entry.parent_frn,
                    name: entry.name,
                    is_directory,
                },
            );
            if !is_directory {
                discovered_files += 1;
                // 粗粒度进度：每 16384 个文件刷一次计数
                if discovered_files & 0x3FFF == 0 {
                    state::set_indexed_count(discovered_files);
                }
            }
        }
    }
    drop(volume);

    if state::indexing_cancelled(request_token) {
        return Ok(ScanOutcome::Cancelled);
    }

    // 根节点：名称为空、父指向自己，是解析的终止条件
    nodes.insert(
        root_frn,
        Node {
            parent_frn: root_frn,
            name: String::new(),
            is_directory: true,
        },
    );

    let Some(files) = index::project_files(&nodes, root_frn, &root_path, include_directories, &|| {
        state::indexing_cancelled(request_token)
    }) else {
        return Ok(ScanOutcome::Cancelled);
    };

    let (journal_id, journal_next_usn, live_updates_supported) = match journal {
        Some(j) => (j.usn_journal_id, j.next_usn, true),
        None => (0, 0, false),
    };
    Ok(ScanOutcome::Complete(IndexSnapshot {
        files,
        nodes,
        root_frn,
        root_path,
        journal_id,
        journal_next_usn,
        live_updates_supported,
    }))
}

/// 后台索引入口：单卷或全盘
pub fn run_indexing(options: ScanOptions, request_token: u64) {
    if options.scan_all_drives {
        run_all_drives(options, request_token);
    } else {
        run_single_drive(options, request_token);
    }
}

fn run_single_drive(options: ScanOptions, request_token: u64) {
    match scan_volume(options.drive, options.include_directories, request_token) {
        Ok(ScanOutcome::Cancelled) => return,
        Ok(ScanOutcome::Complete(snapshot)) => {
            if state::indexing_cancelled(request_token) {
                return;
            }
            let journal_id = snapshot.journal_id;
            let next_usn = snapshot.journal_next_usn;
            let live_supported = snapshot.live_updates_supported;
            let count = state::publish_snapshot(snapshot);
            state::set_ready(true);
            state::set_last_error("");
            log::info!("驱动器 {} 索引完成: {} 项", options.drive, count);
            if live_supported {
                watcher::start(options.drive, journal_id, next_usn);
            } else {
                log::warn!("驱动器 {} 无可用 USN 日志，实时更新关闭", options.drive);
            }
        }
        Err(err) => {
            if state::indexing_cancelled(request_token) {
                return;
            }
            state::set_ready(false);
            state::set_indexed_count(0);
            state::set_last_error(err.to_string());
            log::error!("驱动器 {} 索引失败: {}", options.drive, err);
        }
    }

    if !state::indexing_cancelled(request_token) {
        state::set_indexing(false);
    }
}

fn run_all_drives(options: ScanOptions, request_token: u64) {
    let targets = drives::resolve_target_drives(options.drive, true);
    let mut merged: Vec<IndexedFile> = Vec::with_capacity(300_000);
    let mut combined_error = String::new();
    let mut has_success = false;

    for drive in targets {
        if state::indexing_cancelled(request_token) {
            return;
        }

        match scan_volume(drive, options.include_directories, request_token) {
            Ok(ScanOutcome::Cancelled) => return,
            Ok(ScanOutcome::Complete(snapshot)) => {
                if state::indexing_cancelled(request_token) {
                    return;
                }
                has_success = true;
                merged.extend(snapshot.files);
                state::set_indexed_count(merged.len() as u64);
            }
            Err(err) => {
                if state::indexing_cancelled(request_token) {
                    return;
                }
                // 单卷失败不拖垮整次全盘扫描，错误并列记录
                if !combined_error.is_empty() {
                    combined_error.push_str(" | ");
                }
                combined_error.push(drive);
                combined_error.push_str(": ");
                combined_error.push_str(&err.to_string());
            }
        }
    }

    if state::indexing_cancelled(request_token) {
        return;
    }

    if has_success {
        let count = state::publish_files_only(merged);
        state::set_ready(true);
        state::set_last_error("");
        log::info!("全盘索引完成: {} 项", count);
    } else {
        state::set_ready(false);
        state::set_indexed_count(0);
        state::set_last_error(if combined_error.is_empty() {
            "Unknown indexing error.".to_string()
        } else {
            combined_error
        });
    }

    if !state::indexing_cancelled(request_token) {
        state::set_indexing(false);
    }
}

/// 一次性扫描的简化输出
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicFileRow {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
}

/// 同步扫描一个卷并返回基本文件列表，不触碰全局索引
pub fn scan_basic(drive: char) -> Result<Vec<BasicFileRow>> {
    match scan_volume(drive, false, 0)? {
        ScanOutcome::Complete(snapshot) => Ok(snapshot
            .files
            .into_iter()
            .map(|file| BasicFileRow {
                name: file.name,
                path: file.path,
                is_directory: file.is_directory,
            })
            .collect()),
        // 令牌 0 不参与取消，这个分支不可达
        ScanOutcome::Cancelled => Ok(Vec::new()),
    }
}
