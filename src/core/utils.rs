use anyhow::{bail, Context, Result};

/// Parse a hex string into bytes
/// Supports various formats:
/// - "0102030A" (pure hex)
/// - "01 02 03 0A" (space-separated)
/// - "0x01,0x02,0x03,0x0A" (0x prefix with commas)
/// - "01:02:03:0A" (colon-separated, as UIDs are often printed)
pub fn parse_hex(hex_str: &str) -> Result<Vec<u8>> {
    let cleaned = clean_hex_string(hex_str);

    if cleaned.is_empty() {
        return Ok(Vec::new());
    }

    if cleaned.len() % 2 != 0 {
        bail!(
            "Hex string must have even number of characters: '{}'",
            hex_str
        );
    }

    hex::decode(&cleaned).with_context(|| format!("Invalid hex string: '{hex_str}'"))
}

fn clean_hex_string(hex_str: &str) -> String {
    hex_str
        .trim()
        .replace("0x", "")
        .replace("0X", "")
        .chars()
        .filter(|c| !matches!(c, ' ' | ',' | ':' | '-' | '\t' | '\n' | '\r'))
        .collect()
}

/// Format bytes as a hex string
pub fn format_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Format bytes as a hex string with spaces
pub fn format_hex_spaced(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Format bytes as ASCII, replacing non-printable chars with '.'
pub fn format_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

/// Format tag memory as a dump, one block per line:
/// `0004: 01 02 03 04  |....|`
pub fn format_block_dump(start_block: usize, bytes: &[u8], block_size: usize) -> String {
    if bytes.is_empty() {
        return String::from("(empty)");
    }

    let block_size = block_size.max(1);
    bytes
        .chunks(block_size)
        .enumerate()
        .map(|(i, chunk)| {
            format!(
                "{:04}: {:<width$}  |{}|",
                start_block + i,
                format_hex_spaced(chunk),
                format_ascii(chunk),
                width = block_size * 3 - 1
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Reverse the byte order of a buffer (UIDs are printed LSB-first by some
/// platforms).
pub fn reverse_bytes(src: &[u8]) -> Vec<u8> {
    let mut reversed = src.to_vec();
    reversed.reverse();
    reversed
}

/// Get a human-readable description of SW1/SW2 status words returned by
/// storage card pseudo-APDUs
pub fn describe_status_word(sw1: u8, sw2: u8) -> String {
    match (sw1, sw2) {
        (0x90, 0x00) => "Success".to_string(),
        (0x62, 0x82) => "Warning: End of data reached before Le bytes".to_string(),
        (0x63, 0x00) => "Error: Operation failed".to_string(),
        (0x65, 0x81) => "Error: Memory failure".to_string(),
        (0x67, 0x00) => "Error: Wrong length".to_string(),
        (0x68, 0x00) => "Error: Functions in CLA not supported".to_string(),
        (0x69, 0x81) => "Error: Command incompatible with card".to_string(),
        (0x69, 0x82) => "Error: Security status not satisfied".to_string(),
        (0x69, 0x86) => "Error: Command not allowed".to_string(),
        (0x6A, 0x81) => "Error: Function not supported".to_string(),
        (0x6A, 0x82) => "Error: Block address out of range".to_string(),
        (0x6B, 0x00) => "Error: Wrong parameter(s) P1-P2".to_string(),
        (0x6C, n) => format!("Error: Wrong Le field, exact length: {n}"),
        (0x6D, 0x00) => "Error: Instruction code not supported or invalid".to_string(),
        (0x6E, 0x00) => "Error: Class not supported".to_string(),
        _ => format!("Unknown status: {sw1:02X} {sw2:02X}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_various_formats() {
        assert_eq!(parse_hex("0102030A").unwrap(), vec![0x01, 0x02, 0x03, 0x0A]);
        assert_eq!(
            parse_hex("01 02 03 0A").unwrap(),
            vec![0x01, 0x02, 0x03, 0x0A]
        );
        assert_eq!(
            parse_hex("0x01,0x02,0x03,0x0A").unwrap(),
            vec![0x01, 0x02, 0x03, 0x0A]
        );
        assert_eq!(
            parse_hex("04:a2:3b:c1").unwrap(),
            vec![0x04, 0xA2, 0x3B, 0xC1]
        );
        assert_eq!(parse_hex("").unwrap(), Vec::<u8>::new());
        assert_eq!(parse_hex("   ").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_parse_hex_invalid() {
        assert!(parse_hex("0102030").is_err());
        assert!(parse_hex("0102G30A").is_err());
        assert!(parse_hex("01@02").is_err());
    }

    #[test]
    fn test_format_functions() {
        let bytes = vec![0x01, 0x02, 0x03, 0x0A];
        assert_eq!(format_hex(&bytes), "0102030A");
        assert_eq!(format_hex_spaced(&bytes), "01 02 03 0A");
        assert_eq!(format_hex(&[]), "");
        assert_eq!(format_hex_spaced(&[]), "");
        assert_eq!(format_ascii(b"Hi\x00!"), "Hi.!");
    }

    #[test]
    fn test_format_block_dump() {
        let dump = format_block_dump(4, b"HelloNFC\x01", 4);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "0004: 48 65 6C 6C  |Hell|");
        assert_eq!(lines[1], "0005: 6F 4E 46 43  |oNFC|");
        assert_eq!(lines[2], "0006: 01           |.|");
        assert_eq!(format_block_dump(0, &[], 4), "(empty)");
    }

    #[test]
    fn test_reverse_bytes() {
        assert_eq!(
            reverse_bytes(&[0x01, 0x02, 0x03, 0x04]),
            vec![0x04, 0x03, 0x02, 0x01]
        );
        // odd length keeps the middle byte in place
        assert_eq!(
            reverse_bytes(&[0x04, 0xA2, 0x3B, 0xC1, 0x5D, 0x80, 0x11]),
            vec![0x11, 0x80, 0x5D, 0xC1, 0x3B, 0xA2, 0x04]
        );
        assert_eq!(reverse_bytes(&[0x7F]), vec![0x7F]);
        assert!(reverse_bytes(&[]).is_empty());
    }

    #[test]
    fn test_describe_status_word() {
        assert_eq!(describe_status_word(0x90, 0x00), "Success");
        assert_eq!(describe_status_word(0x63, 0x00), "Error: Operation failed");
        assert_eq!(
            describe_status_word(0x6C, 0x08),
            "Error: Wrong Le field, exact length: 8"
        );
        assert_eq!(describe_status_word(0x12, 0x34), "Unknown status: 12 34");
    }
}
