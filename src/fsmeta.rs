//! 文件元数据读取
//!
//! 搜索求值器和重复扫描都要按路径取大小与时间戳，
//! 并区分「文件已不存在」和其他 I/O 失败。

use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

/// 某个路径的大小和时间戳，时间为 Unix 秒
#[derive(Debug, Clone, Copy, Default)]
pub struct FileMeta {
    pub size: u64,
    pub created_unix: i64,
    pub modified_unix: i64,
}

/// 缺失类错误码：文件/路径不存在、名称非法、网络路径失效、设备未就绪。
/// 索引落后于文件系统时命中这些码，条目按过期处理静默丢弃。
pub fn is_missing_path_code(code: i32) -> bool {
    matches!(code, 2 | 3 | 21 | 53 | 67 | 123)
}

fn unix_seconds(time: io::Result<SystemTime>) -> i64 {
    match time {
        Ok(t) => match t.duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_secs() as i64,
            // 早于 Unix 纪元的时间戳归零
            Err(_) => 0,
        },
        Err(_) => 0,
    }
}

/// 读取路径元数据，失败时错误里带原始系统错误码
pub fn read_file_metadata(path: &str) -> io::Result<FileMeta> {
    let metadata = std::fs::metadata(path)?;
    Ok(FileMeta {
        size: metadata.len(),
        created_unix: unix_seconds(metadata.created()),
        modified_unix: unix_seconds(metadata.modified()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn classifies_missing_codes() {
        assert!(is_missing_path_code(2));
        assert!(is_missing_path_code(3));
        assert!(is_missing_path_code(123));
        assert!(!is_missing_path_code(5));
        assert!(!is_missing_path_code(0));
    }

    #[test]
    fn reads_size_of_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&[0u8; 321]).unwrap();
        drop(file);

        let meta = read_file_metadata(path.to_str().unwrap()).unwrap();
        assert_eq!(meta.size, 321);
        assert!(meta.modified_unix > 0);
    }

    #[test]
    fn missing_file_error_carries_os_code() {
        let err = read_file_metadata("definitely/not/here.txt").unwrap_err();
        let code = err.raw_os_error().unwrap_or(0);
        assert!(is_missing_path_code(code), "unexpected code {code}");
    }
}
