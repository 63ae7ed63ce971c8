//! USN 日志实时监控（仅 Windows）
//!
//! 枚举成功后由驱动启动，从记录的水位 USN 开始增量消费日志，
//! 每次读取作为一个批次在写锁内应用。新枚举启动会让它退出。

use std::ffi::c_void;
use std::mem::size_of;
use std::time::Duration;

use crate::mft::{
    open_volume, vol_ioctl, win32_code, win32_error_text, ERROR_HANDLE_EOF,
    ERROR_INVALID_PARAMETER, ERROR_JOURNAL_DELETE_IN_PROGRESS, ERROR_JOURNAL_ENTRY_DELETED,
    ERROR_JOURNAL_NOT_ACTIVE, FSCTL_READ_USN_JOURNAL,
};
use crate::records;
use crate::state;

const WATCH_BUFFER_SIZE: usize = 1024 * 1024;
/// 日志暂时无新记录时的等待间隔
const IDLE_SLEEP: Duration = Duration::from_millis(120);

/// READ_USN_JOURNAL_DATA_V0
#[repr(C)]
pub struct ReadUsnJournalData {
    pub start_usn: i64,
    pub reason_mask: u32,
    pub return_only_on_close: u32,
    pub timeout: u64,
    pub bytes_to_wait_for: u64,
    pub usn_journal_id: u64,
}

/// 日志已不可续读：截断、删除或失效，只能整卷重建
fn is_journal_gone_code(code: u32) -> bool {
    matches!(
        code,
        ERROR_JOURNAL_ENTRY_DELETED
            | ERROR_JOURNAL_DELETE_IN_PROGRESS
            | ERROR_JOURNAL_NOT_ACTIVE
            | ERROR_INVALID_PARAMETER
    )
}

/// 启动监控线程。journal_id 为 0 或水位非法时直接放弃。
pub fn start(drive: char, journal_id: u64, start_usn: i64) {
    if journal_id == 0 || start_usn <= 0 {
        return;
    }
    let token = state::begin_live_watcher();
    std::thread::spawn(move || watch_loop(drive, journal_id, start_usn, token));
}

fn watch_loop(drive: char, journal_id: u64, start_usn: i64, token: u64) {
    let volume = match open_volume(drive) {
        Ok(volume) => volume,
        Err(err) => {
            if !state::watcher_cancelled(token) {
                state::set_last_error(win32_error_text(
                    "Live updates could not start (unable to open volume).",
                    &err,
                ));
            }
            return;
        }
    };

    let mut read_data = ReadUsnJournalData {
        start_usn,
        reason_mask: 0xFFFF_FFFF,
        return_only_on_close: 0,
        timeout: 0,
        bytes_to_wait_for: 0,
        usn_journal_id: journal_id,
    };
    let mut buffer = vec![0u8; WATCH_BUFFER_SIZE];
    log::info!("驱动器 {} 实时监控启动, start_usn={}", drive, start_usn);

    while !state::watcher_cancelled(token) {
        let returned = match vol_ioctl(
            volume.0,
            FSCTL_READ_USN_JOURNAL,
            Some((
                &read_data as *const ReadUsnJournalData as *const c_void,
                size_of::<ReadUsnJournalData>() as u32,
            )),
            Some((buffer.as_mut_ptr() as *mut c_void, WATCH_BUFFER_SIZE as u32)),
        ) {
            Ok(n) => n as usize,
            Err(err) => {
                if state::watcher_cancelled(token) {
                    break;
                }
                let code = win32_code(&err);
                if code == ERROR_HANDLE_EOF {
                    std::thread::sleep(IDLE_SLEEP);
                    continue;
                }
                if is_journal_gone_code(code) {
                    state::set_last_error(
                        "Live updates paused because the USN journal changed. Click Reindex.",
                    );
                    log::warn!("驱动器 {} 日志失效 (0x{:08X})，监控退出", drive, code);
                    break;
                }
                state::set_last_error(win32_error_text(
                    "Live updates paused because USN monitoring failed.",
                    &err,
                ));
                log::error!("驱动器 {} 日志读取失败: 0x{:08X}", drive, code);
                break;
            }
        };

        if returned < 8 {
            std::thread::sleep(IDLE_SLEEP);
            continue;
        }

        // 回复的前 8 字节是下一次读取要传回的 USN
        read_data.start_usn = i64::from_le_bytes(buffer[0..8].try_into().unwrap());
        if returned == 8 {
            std::thread::sleep(IDLE_SLEEP);
            continue;
        }

        let batch = records::walk_records(&buffer[8..returned]);
        if batch.is_empty() || state::watcher_cancelled(token) {
            continue;
        }

        let include_directories = state::include_directories();
        let count = {
            let mut index = state::INDEX.write();
            index.apply_change_batch(&batch, include_directories)
        };
        state::set_indexed_count(count as u64);
    }
}
