//! Formatting of forwarded chunks for debug traces.

use std::borrow::Cow;
use std::fmt::Write;

const ROW_WIDTH: usize = 16;

/// How a forwarded chunk is rendered in trace output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TraceFormat {
    /// Lossy UTF-8 text.
    #[default]
    Raw,
    /// Canonical hex dump with offsets and an ASCII gutter.
    Hex,
}

impl TraceFormat {
    pub fn from_hex_flag(output_hex: bool) -> Self {
        if output_hex {
            TraceFormat::Hex
        } else {
            TraceFormat::Raw
        }
    }

    pub fn render<'a>(&self, chunk: &'a [u8]) -> Cow<'a, str> {
        match self {
            TraceFormat::Raw => String::from_utf8_lossy(chunk),
            TraceFormat::Hex => Cow::Owned(hex_dump(chunk)),
        }
    }
}

/// Render `data` as `offset  hex bytes  |ascii|` rows of 16 bytes.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(ROW_WIDTH) * 80);

    for (row, chunk) in data.chunks(ROW_WIDTH).enumerate() {
        let encoded = hex::encode(chunk);
        let _ = write!(out, "{:08x} ", row * ROW_WIDTH);

        for i in 0..ROW_WIDTH {
            if i == ROW_WIDTH / 2 {
                out.push(' ');
            }
            match encoded.get(i * 2..i * 2 + 2) {
                Some(byte) => {
                    out.push(' ');
                    out.push_str(byte);
                }
                None => out.push_str("   "),
            }
        }

        out.push_str("  |");
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_dump_short_row() {
        let dump = hex_dump(b"ping");
        assert!(dump.starts_with("00000000  70 69 6e 67 "));
        assert!(dump.ends_with("  |ping|\n"));
        assert_eq!(dump.lines().count(), 1);
    }

    #[test]
    fn test_hex_dump_multiple_rows() {
        let data: Vec<u8> = (0u8..20).collect();
        let dump = hex_dump(&data);
        let lines: Vec<&str> = dump.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000000  00 01 02 03 04 05 06 07  08 09"));
        assert!(lines[0].ends_with("|................|"));
        assert!(lines[1].starts_with("00000010  10 11 12 13"));
        // Every row is padded to the same width before the gutter.
        assert_eq!(lines[0].find('|'), lines[1].find('|'));
    }

    #[test]
    fn test_hex_dump_empty() {
        assert_eq!(hex_dump(&[]), "");
    }

    #[test]
    fn test_render_raw_is_lossy() {
        let rendered = TraceFormat::Raw.render(&[b'o', b'k', 0xff]);
        assert_eq!(rendered, "ok\u{fffd}");
    }

    #[test]
    fn test_from_hex_flag() {
        assert_eq!(TraceFormat::from_hex_flag(true), TraceFormat::Hex);
        assert_eq!(TraceFormat::from_hex_flag(false), TraceFormat::Raw);
    }
}
