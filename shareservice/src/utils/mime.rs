//! Content-based mimetype detection.
//!
//! Uploads are classified by their leading bytes, never by the name or the
//! content type the client claims.

/// Bytes needed to classify every supported format.
pub const SNIFF_LEN: usize = 64;

/// Fallback for content that matches no known signature.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Brands of plain MP4 video.
const MP4_BRANDS: &[&[u8; 4]] = &[
    b"isom", b"iso2", b"iso3", b"iso4", b"iso5", b"iso6", b"mp41", b"mp42", b"avc1", b"M4V ",
    b"dash", b"mmp4",
];

/// Major brands of other ISO base media formats, checked before the MP4 set.
const OTHER_BRANDS: &[(&[u8; 4], &str)] = &[
    (b"qt  ", "video/quicktime"),
    (b"heic", "image/heic"),
    (b"heix", "image/heic"),
    (b"heim", "image/heic"),
    (b"heis", "image/heic"),
    (b"hevc", "image/heic-sequence"),
    (b"hevx", "image/heic-sequence"),
    (b"mif1", "image/heif"),
    (b"msf1", "image/heif-sequence"),
    (b"avif", "image/avif"),
    (b"avis", "image/avif"),
    (b"M4A ", "audio/mp4"),
    (b"M4B ", "audio/mp4"),
    (b"M4P ", "audio/mp4"),
    (b"crx ", "image/x-canon-cr3"),
];

/// Detect the mimetype of a buffer from its leading bytes.
pub fn sniff(head: &[u8]) -> &'static str {
    if head.is_empty() {
        return OCTET_STREAM;
    }

    if let Ok(format) = image::guess_format(head) {
        return format.to_mime_type();
    }

    if let Some(mime) = sniff_isobmff(head) {
        return mime;
    }

    OCTET_STREAM
}

/// ISO base media files start with an `ftyp` box: size, `ftyp`, major brand,
/// minor version, then compatible brands.
///
/// Only the major brand decides for formats we know by name; an unknown major
/// brand counts as MP4 when an MP4 brand is listed as compatible.
fn sniff_isobmff(head: &[u8]) -> Option<&'static str> {
    if head.len() < 12 {
        return None;
    }
    let box_size = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
    if box_size < 8 || &head[4..8] != b"ftyp" {
        return None;
    }

    let major = &head[8..12];
    if let Some((_, mime)) = OTHER_BRANDS.iter().find(|(brand, _)| brand.as_slice() == major) {
        return Some(*mime);
    }
    if major.starts_with(b"3gp") {
        return Some("video/3gpp");
    }
    if major.starts_with(b"3g2") {
        return Some("video/3gpp2");
    }
    if is_mp4_brand(major) {
        return Some("video/mp4");
    }

    let end = box_size.min(head.len());
    let compatible_mp4 = head
        .get(16..end)
        .unwrap_or_default()
        .chunks_exact(4)
        .any(is_mp4_brand);
    Some(if compatible_mp4 { "video/mp4" } else { OCTET_STREAM })
}

fn is_mp4_brand(brand: &[u8]) -> bool {
    MP4_BRANDS.iter().any(|b| b.as_slice() == brand)
}
