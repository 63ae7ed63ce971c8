//! USN 变更记录解析模块
//!
//! MFT 枚举和日志监控返回的缓冲区共用同一种记录布局，
//! 这里负责把原始字节解析成统一的 [`ChangeRecord`]。

/// 变更原因掩码（Windows SDK 定义值）
pub const REASON_FILE_DELETE: u32 = 0x0000_0200;
pub const REASON_RENAME_OLD_NAME: u32 = 0x0000_1000;
pub const REASON_RENAME_NEW_NAME: u32 = 0x0000_2000;

const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x10;

/// V2 布局（64 位 FRN）字段偏移
const V2_MIN_LEN: usize = 64;
const V2_FRN: usize = 8;
const V2_PARENT_FRN: usize = 16;
const V2_REASON: usize = 40;
const V2_ATTRIBUTES: usize = 52;
const V2_NAME_LEN: usize = 56;
const V2_NAME_OFFSET: usize = 58;

/// V3 布局（128 位 FRN）字段偏移
const V3_MIN_LEN: usize = 80;
const V3_FRN: usize = 8;
const V3_PARENT_FRN: usize = 24;
const V3_REASON: usize = 56;
const V3_ATTRIBUTES: usize = 68;
const V3_NAME_LEN: usize = 72;
const V3_NAME_OFFSET: usize = 74;

/// 解码后的日志条目
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub frn: u64,
    pub parent_frn: u64,
    pub name: String,
    pub is_directory: bool,
    pub reason: u32,
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap())
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

/// 128 位文件标识取低 64 位作为内部 FRN
fn read_frn128(buf: &[u8], offset: usize) -> u64 {
    read_u64(buf, offset)
}

fn decode_name(record: &[u8], name_offset: usize, name_len: usize) -> String {
    let bytes = &record[name_offset..name_offset + name_len];
    let wide: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&wide)
}

/// 解析单条记录，`record` 是以 RecordLength 开头的完整切片。
///
/// 名称越界或版本不支持时返回 None，调用方跳过该条记录。
pub fn parse_record(record: &[u8]) -> Option<ChangeRecord> {
    if record.len() < V2_MIN_LEN {
        return None;
    }

    let record_length = read_u32(record, 0) as usize;
    let major_version = read_u16(record, 4);

    match major_version {
        2 => {
            let name_len = read_u16(record, V2_NAME_LEN) as usize;
            let name_offset = read_u16(record, V2_NAME_OFFSET) as usize;
            if name_offset + name_len > record_length {
                return None;
            }
            let attributes = read_u32(record, V2_ATTRIBUTES);
            Some(ChangeRecord {
                frn: read_u64(record, V2_FRN),
                parent_frn: read_u64(record, V2_PARENT_FRN),
                name: decode_name(record, name_offset, name_len),
                is_directory: attributes & FILE_ATTRIBUTE_DIRECTORY != 0,
                reason: read_u32(record, V2_REASON),
            })
        }
        3 => {
            if record.len() < V3_MIN_LEN {
                return None;
            }
            let name_len = read_u16(record, V3_NAME_LEN) as usize;
            let name_offset = read_u16(record, V3_NAME_OFFSET) as usize;
            if name_offset + name_len > record_length {
                return None;
            }
            let attributes = read_u32(record, V3_ATTRIBUTES);
            Some(ChangeRecord {
                frn: read_frn128(record, V3_FRN),
                parent_frn: read_frn128(record, V3_PARENT_FRN),
                name: decode_name(record, name_offset, name_len),
                is_directory: attributes & FILE_ATTRIBUTE_DIRECTORY != 0,
                reason: read_u32(record, V3_REASON),
            })
        }
        _ => None,
    }
}

/// 遍历 ioctl 返回的记录区（已去掉 8 字节 USN/FRN 前缀）。
///
/// 空名称的记录在这里就被丢弃，两个调用方都不需要它们。
pub fn walk_records(block: &[u8]) -> Vec<ChangeRecord> {
    let mut out = Vec::with_capacity(128);
    let mut offset = 0usize;

    while offset + 4 <= block.len() {
        let record_length = read_u32(block, offset) as usize;
        if record_length == 0 || offset + record_length > block.len() {
            break;
        }

        let record = &block[offset..offset + record_length];
        if let Some(entry) = parse_record(record) {
            if !entry.name.is_empty() {
                out.push(entry);
            }
        }

        offset += record_length;
    }

    out
}
