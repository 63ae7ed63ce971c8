//! 逻辑驱动器枚举与文件系统探测

use serde::Serialize;

/// 一个逻辑驱动器的描述
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveRow {
    pub letter: String,
    pub path: String,
    pub filesystem: String,
    pub drive_type: String,
    pub is_ntfs: bool,
    pub can_open_volume: bool,
}

/// 盘符归一化：取首字符转大写，非法输入回落到 C
pub fn normalize_drive_letter(input: &str) -> char {
    let first = input.trim().chars().next().unwrap_or('C');
    let upper = first.to_ascii_uppercase();
    if upper.is_ascii_uppercase() {
        upper
    } else {
        'C'
    }
}

#[cfg(windows)]
mod imp {
    use super::DriveRow;
    use crate::mft::open_volume;
    use windows::core::PCWSTR;
    use windows::Win32::Storage::FileSystem::{
        GetDriveTypeW, GetLogicalDriveStringsW, GetVolumeInformationW,
    };

    fn drive_type_text(drive_type: u32) -> &'static str {
        match drive_type {
            3 => "fixed",
            2 => "removable",
            4 => "network",
            5 => "cdrom",
            6 => "ramdisk",
            1 => "no-root",
            _ => "unknown",
        }
    }

    /// 只有 NTFS 卷才值得试开，其余直接标记为不可打开
    fn can_open_volume(letter: char) -> bool {
        open_volume(letter).is_ok()
    }

    pub fn list_drives() -> Vec<DriveRow> {
        let required = unsafe { GetLogicalDriveStringsW(None) };
        if required == 0 {
            return Vec::new();
        }
        let mut raw = vec![0u16; required as usize + 1];
        let written = unsafe { GetLogicalDriveStringsW(Some(raw.as_mut_slice())) };
        if written == 0 {
            return Vec::new();
        }

        let mut rows = Vec::new();
        let mut cursor = 0usize;
        while cursor < raw.len() && raw[cursor] != 0 {
            let end = raw[cursor..]
                .iter()
                .position(|&c| c == 0)
                .map(|p| cursor + p)
                .unwrap_or(raw.len());
            let root = &raw[cursor..end];
            cursor = end + 1;
            if root.len() < 2 {
                continue;
            }

            let letter = char::from_u32(u32::from(root[0]))
                .unwrap_or('\0')
                .to_ascii_uppercase();
            if !letter.is_ascii_uppercase() {
                continue;
            }

            let mut root_z: Vec<u16> = root.to_vec();
            root_z.push(0);
            let drive_type = unsafe { GetDriveTypeW(PCWSTR(root_z.as_ptr())) };

            let mut fs_buffer = [0u16; 64];
            let has_fs = unsafe {
                GetVolumeInformationW(
                    PCWSTR(root_z.as_ptr()),
                    None,
                    None,
                    None,
                    None,
                    Some(&mut fs_buffer[..]),
                )
            }
            .is_ok();
            let filesystem = if has_fs {
                let len = fs_buffer.iter().position(|&c| c == 0).unwrap_or(fs_buffer.len());
                String::from_utf16_lossy(&fs_buffer[..len])
            } else {
                String::new()
            };

            let is_ntfs = filesystem.eq_ignore_ascii_case("ntfs");
            let can_open = is_ntfs && can_open_volume(letter);

            rows.push(DriveRow {
                letter: letter.to_string(),
                path: String::from_utf16_lossy(root),
                filesystem,
                drive_type: drive_type_text(drive_type).to_string(),
                is_ntfs,
                can_open_volume: can_open,
            });
        }
        rows
    }

    /// 全盘扫描的目标卷：可打开的 NTFS 卷；一个都没有就退回首选盘
    pub fn resolve_target_drives(preferred: char, scan_all_drives: bool) -> Vec<char> {
        if !scan_all_drives {
            return vec![preferred];
        }
        let mut targets: Vec<char> = list_drives()
            .into_iter()
            .filter(|row| row.is_ntfs && row.can_open_volume)
            .filter_map(|row| row.letter.chars().next())
            .collect();
        if targets.is_empty() {
            targets.push(preferred);
        }
        targets
    }
}

#[cfg(windows)]
pub use imp::{list_drives, resolve_target_drives};

#[cfg(not(windows))]
pub fn list_drives() -> Vec<DriveRow> {
    Vec::new()
}
