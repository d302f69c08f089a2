use std::io::{Read, Write};
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::{Compression, Crc};
use regex::bytes::Regex;
use tracing::debug;

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Ancillary PNG chunks that carry no pixels
const PNG_DROPPED_CHUNKS: &[&[u8; 4]] = &[b"tEXt", b"zTXt", b"iTXt", b"tIME"];

const XMP_NAMESPACE: &[u8] = b"http://ns.adobe.com/xap/1.0/";

static SVG_COMMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<!--.*?-->").expect("hardcoded svg comment pattern is valid")
});

/// Result of an optimization attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Optimized {
    pub bytes: Vec<u8>,
    pub applied: bool,
}

/// Losslessly shrink an asset of a known type.
///
/// The rewritten bytes are kept only when smaller; unknown types and
/// files that fail to parse are returned unchanged.
pub fn optimize(ext: &str, bytes: &[u8]) -> Optimized {
    let attempt = match ext {
        "png" => optimize_png(bytes),
        "jpg" | "jpeg" => optimize_jpeg(bytes),
        "svg" => Ok(SVG_COMMENT.replace_all(bytes, &b""[..]).into_owned()),
        _ => return Optimized { bytes: bytes.to_vec(), applied: false },
    };

    match attempt {
        Ok(smaller) if smaller.len() < bytes.len() => {
            debug!("Optimized {} asset: {} -> {} bytes", ext, bytes.len(), smaller.len());
            Optimized { bytes: smaller, applied: true }
        }
        Ok(_) => Optimized { bytes: bytes.to_vec(), applied: false },
        Err(e) => {
            debug!("Leaving {} asset as is: {:#}", ext, e);
            Optimized { bytes: bytes.to_vec(), applied: false }
        }
    }
}

fn png_chunk(out: &mut Vec<u8>, kind: &[u8], data: &[u8]) {
    let mut crc = Crc::new();
    crc.update(kind);
    crc.update(data);

    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    out.extend_from_slice(&crc.sum().to_be_bytes());
}

/// Recompress image data at the best zlib level and drop text/time chunks
fn optimize_png(bytes: &[u8]) -> Result<Vec<u8>> {
    if !bytes.starts_with(PNG_SIGNATURE) {
        bail!("missing PNG signature");
    }

    let mut chunks = Vec::new();
    let mut idat = Vec::new();
    let mut pos = PNG_SIGNATURE.len();
    while pos + 12 <= bytes.len() {
        let len = u32::from_be_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]) as usize;
        let kind = &bytes[pos + 4..pos + 8];
        let end = pos + 12 + len;
        if end > bytes.len() {
            bail!("truncated PNG chunk");
        }
        let data = &bytes[pos + 8..pos + 8 + len];

        if kind == b"IDAT" {
            if idat.is_empty() {
                // Placeholder keeps the position of the image data
                chunks.push((kind, &[][..]));
            }
            idat.extend_from_slice(data);
        } else if !PNG_DROPPED_CHUNKS.iter().any(|dropped| kind == &dropped[..]) {
            chunks.push((kind, data));
        }

        pos = end;
        if kind == b"IEND" {
            break;
        }
    }
    if idat.is_empty() {
        bail!("PNG without image data");
    }

    let mut raw = Vec::new();
    ZlibDecoder::new(&idat[..]).read_to_end(&mut raw).context("corrupt PNG image data")?;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(&raw)?;
    let recompressed = encoder.finish()?;
    let image_data = if recompressed.len() < idat.len() { recompressed } else { idat };

    let mut out = Vec::with_capacity(bytes.len());
    out.extend_from_slice(PNG_SIGNATURE);
    for (kind, data) in chunks {
        if kind == b"IDAT" {
            png_chunk(&mut out, kind, &image_data);
        } else {
            png_chunk(&mut out, kind, data);
        }
    }
    Ok(out)
}

/// Whether a JPEG segment only carries metadata the decoder ignores.
///
/// EXIF (APP1) stays for its orientation tag; ICC profiles (APP2) stay.
fn is_droppable_jpeg_segment(marker: u8, payload: &[u8]) -> bool {
    match marker {
        0xFE => true,
        0xE1 => payload.starts_with(XMP_NAMESPACE),
        0xE3..=0xED | 0xEF => true,
        _ => false,
    }
}

/// Strip comments and vendor metadata segments
fn optimize_jpeg(bytes: &[u8]) -> Result<Vec<u8>> {
    if !bytes.starts_with(&[0xFF, 0xD8]) {
        bail!("missing JPEG start marker");
    }

    let mut out = Vec::with_capacity(bytes.len());
    out.extend_from_slice(&bytes[..2]);
    let mut pos = 2;

    while pos + 4 <= bytes.len() {
        if bytes[pos] != 0xFF {
            bail!("unexpected byte in JPEG header");
        }
        let marker = bytes[pos + 1];

        // Entropy-coded data follows start of scan; copy the rest as is
        if marker == 0xDA {
            out.extend_from_slice(&bytes[pos..]);
            return Ok(out);
        }

        let len = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
        let end = pos + 2 + len;
        if len < 2 || end > bytes.len() {
            bail!("truncated JPEG segment");
        }

        if !is_droppable_jpeg_segment(marker, &bytes[pos + 4..end]) {
            out.extend_from_slice(&bytes[pos..end]);
        }
        pos = end;
    }

    bail!("JPEG without image data")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_with_metadata(raw: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::none());
        encoder.write_all(raw).unwrap();
        let idat = encoder.finish().unwrap();

        let mut ihdr = Vec::new();
        ihdr.extend_from_slice(&16u32.to_be_bytes());
        ihdr.extend_from_slice(&16u32.to_be_bytes());
        ihdr.extend_from_slice(&[8, 0, 0, 0, 0]);

        let mut png = PNG_SIGNATURE.to_vec();
        png_chunk(&mut png, b"IHDR", &ihdr);
        png_chunk(&mut png, b"tEXt", b"Comment\0made with an editor");
        png_chunk(&mut png, b"IDAT", &idat[..idat.len() / 2]);
        png_chunk(&mut png, b"IDAT", &idat[idat.len() / 2..]);
        png_chunk(&mut png, b"IEND", b"");
        png
    }

    #[test]
    fn test_png_is_recompressed_losslessly() {
        // 16x16 grayscale, one filter byte per row
        let raw: Vec<u8> = (0..16).flat_map(|_| std::iter::once(0).chain(std::iter::repeat(200).take(16))).collect();
        let original = png_with_metadata(&raw);

        let result = optimize("png", &original);
        assert!(result.applied);
        assert!(result.bytes.len() < original.len());
        assert!(result.bytes.starts_with(PNG_SIGNATURE));
        assert!(!result.bytes.windows(4).any(|w| w == b"tEXt"));
        assert_eq!(result.bytes.windows(4).filter(|w| *w == b"IDAT").count(), 1);

        // Decode the single image chunk again
        let idat_at = result.bytes.windows(4).position(|w| w == b"IDAT").unwrap();
        let len = u32::from_be_bytes(result.bytes[idat_at - 4..idat_at].try_into().unwrap()) as usize;
        let data = &result.bytes[idat_at + 4..idat_at + 4 + len];
        let mut decoded = Vec::new();
        ZlibDecoder::new(data).read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, raw);

        let mut crc = Crc::new();
        crc.update(b"IDAT");
        crc.update(data);
        let stored = u32::from_be_bytes(result.bytes[idat_at + 4 + len..idat_at + 8 + len].try_into().unwrap());
        assert_eq!(stored, crc.sum());
    }

    #[test]
    fn test_jpeg_metadata_is_stripped() {
        let mut jpeg = vec![0xFF, 0xD8];
        jpeg.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x07, b'J', b'F', b'I', b'F', 0x00]);
        jpeg.extend_from_slice(&[0xFF, 0xFE, 0x00, 0x07, b'h', b'e', b'l', b'l', b'o']);
        jpeg.extend_from_slice(&[0xFF, 0xED, 0x00, 0x04, 0x01, 0x02]);
        jpeg.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x02, 0x11, 0x22, 0xFF, 0xD9]);

        let result = optimize("jpg", &jpeg);
        assert!(result.applied);
        assert_eq!(
            result.bytes,
            vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x07, b'J', b'F', b'I', b'F', 0x00, 0xFF, 0xDA, 0x00, 0x02, 0x11, 0x22, 0xFF, 0xD9]
        );
    }

    #[test]
    fn test_svg_comments_and_unknown_types() {
        let svg = b"<svg><!-- exported\nby tool --><rect/></svg>";
        assert_eq!(optimize("svg", svg).bytes, b"<svg><rect/></svg>".to_vec());

        let css = b"body { color: red }";
        let result = optimize("css", css);
        assert!(!result.applied);
        assert_eq!(result.bytes, css.to_vec());

        let broken = optimize("png", b"not a png");
        assert!(!broken.applied);
    }
}
