//! SerialEM/Tomo `.mdoc` files.
//!
//! An mdoc is a header of `Key = Value` lines followed by one
//! `[ZValue = N]` section per tilt image. The section count is the number
//! of tilts the series is expected to have.

use crate::error::Result;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

const SECTION_MARKER: &str = "[ZValue";

/// Number of `[ZValue ...]` sections.
///
/// Header values are free text written by the acquisition software and are
/// not always UTF-8 (Latin-1 `µ` in pixel-size notes), so lines are decoded
/// lossily.
pub fn count_blocks(mut reader: impl BufRead) -> Result<usize> {
    let mut count = 0;
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        if String::from_utf8_lossy(&line).trim_start().starts_with(SECTION_MARKER) {
            count += 1;
        }
    }
    Ok(count)
}

pub fn read_expected_size(path: &Path) -> Result<usize> {
    let file = File::open(path)?;
    count_blocks(BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "PixelSpacing = 1.35\n\
        Voltage = 300\n\
        ImageSize = 4096 4096\n\
        \n\
        [ZValue = 0]\n\
        TiltAngle = 0.0\n\
        SubFramePath = X:\\data\\Position_1_[0.0].tiff\n\
        \n\
        [ZValue = 1]\n\
        TiltAngle = 3.0\n\
        \n\
        [ZValue = 2]\n\
        TiltAngle = -3.0\n";

    #[test]
    fn test_counts_sections() {
        assert_eq!(count_blocks(SAMPLE.as_bytes()).unwrap(), 3);
        assert_eq!(count_blocks("Voltage = 300\n".as_bytes()).unwrap(), 0);
    }

    #[test]
    fn test_counts_sections_past_latin1_header() {
        let mut bytes = b"PixelSpacing = 1.35\nNote = 5 \xb5m defocus\n".to_vec();
        bytes.extend_from_slice(b"[ZValue = 0]\nTiltAngle = 0.0\n[ZValue = 1]\nTiltAngle = 3.0\n");
        assert_eq!(count_blocks(bytes.as_slice()).unwrap(), 2);
    }
}
