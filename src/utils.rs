//! Utility functions

use crate::error::CodecError;
use bytes::BufMut;

/// Decode a NUL-padded UTF-8 field
pub fn read_fixed_str(field: &[u8], name: &str) -> Result<String, CodecError> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end])
        .map(|s| s.trim_end().to_string())
        .map_err(|e| CodecError::MalformedHeader(format!("{} is not valid UTF-8: {}", name, e)))
}

/// Encode a string into a NUL-padded field of `width` bytes.
///
/// Values longer than the field are cut at the last character boundary that fits.
pub fn put_fixed_str(buf: &mut impl BufMut, value: &str, width: usize) {
    let mut end = value.len().min(width);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    buf.put_slice(&value.as_bytes()[..end]);
    buf.put_bytes(0, width - end);
}

/// Format byte size in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_str_round_trip() {
        let mut buf = Vec::new();
        put_fixed_str(&mut buf, "Pressure", 16);
        assert_eq!(buf.len(), 16);
        assert_eq!(read_fixed_str(&buf, "label").unwrap(), "Pressure");
    }

    #[test]
    fn test_fixed_str_truncates_on_char_boundary() {
        let mut buf = Vec::new();
        put_fixed_str(&mut buf, "µm/s²", 4);
        assert_eq!(buf.len(), 4);
        assert_eq!(read_fixed_str(&buf, "unit").unwrap(), "µm/");
    }

    #[test]
    fn test_fixed_str_rejects_invalid_utf8() {
        let err = read_fixed_str(&[0xff, 0xfe, 0], "id").unwrap_err();
        assert!(matches!(err, CodecError::MalformedHeader(_)));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }
}
