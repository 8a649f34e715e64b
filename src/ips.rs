//! IPS patch encoding.
//!
//! An IPS patch is a series of `{offset, length, data}` records
//! describing the bytes that differ between a base image and a target
//! image.  Offsets are 24-bit big-endian and lengths 16-bit, so a
//! patch can address the first 16MB of a file in runs of up to 65535
//! bytes.

const MAGIC: &[u8] = b"PATCH";
const TRAILER: &[u8] = b"EOF";
/// A record starting at this offset would read back as the trailer.
const EOF_OFFSET: usize = 0x454f46;
const MAX_RUN: usize = 0xffff;

/// Encodes the bytes that differ between `base` and `image` as an IPS
/// patch.  The base is treated as zero-filled past its end.
pub fn encode(base: &[u8], image: &[u8]) -> Vec<u8> {
    let mut patch = MAGIC.to_vec();
    let mut i = 0;
    while i < image.len() {
        if image[i] == base_byte(base, i) {
            i += 1;
            continue;
        }
        // An offset of $454f46 spells "EOF", which a decoder reads as
        // the end of the patch.  Start such a record one byte early.
        let start = if i == EOF_OFFSET { i - 1 } else { i };
        let mut end = start + 1;
        while end < image.len()
            && end - start < MAX_RUN
            && image[end] != base_byte(base, end)
        {
            end += 1;
        }
        patch.extend_from_slice(&(start as u32).to_be_bytes()[1..]);
        patch.extend_from_slice(&((end - start) as u16).to_be_bytes());
        patch.extend_from_slice(&image[start..end]);
        i = end;
    }
    patch.extend_from_slice(TRAILER);
    patch
}

fn base_byte(base: &[u8], i: usize) -> u8 {
    base.get(i).copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal decoder, enough to check what we encode.
    fn apply(patch: &[u8], base: &[u8]) -> Vec<u8> {
        assert_eq!(&patch[..5], MAGIC);
        let mut image = base.to_vec();
        let mut i = 5;
        loop {
            assert!(i + 3 <= patch.len());
            if &patch[i..i + 3] == TRAILER {
                break;
            }
            let offset = u32::from_be_bytes([0, patch[i], patch[i + 1], patch[i + 2]]) as usize;
            let len = u16::from_be_bytes([patch[i + 3], patch[i + 4]]) as usize;
            assert!(len > 0, "RLE records are never emitted");
            let data = &patch[i + 5..i + 5 + len];
            if image.len() < offset + len {
                image.resize(offset + len, 0);
            }
            image[offset..offset + len].copy_from_slice(data);
            i += 5 + len;
        }
        image
    }

    #[test]
    fn encodes_a_single_run() {
        let base = [0x00, 0x01, 0x02, 0x03];
        let image = [0xa9, 0x03, 0x02, 0x03];
        let patch = encode(&base, &image);
        assert_eq!(
            patch,
            b"PATCH\x00\x00\x00\x00\x02\xa9\x03EOF".to_vec()
        );
        assert_eq!(apply(&patch, &base), image);
    }

    #[test]
    fn identical_images_need_no_records() {
        let data = [1, 2, 3, 4];
        assert_eq!(encode(&data, &data), b"PATCHEOF".to_vec());
    }

    #[test]
    fn separate_runs_become_separate_records() {
        let base = [0u8; 8];
        let mut image = [0u8; 8];
        image[1] = 0xaa;
        image[6] = 0xbb;
        let patch = encode(&base, &image);
        assert_eq!(
            patch,
            b"PATCH\x00\x00\x01\x00\x01\xaa\x00\x00\x06\x00\x01\xbbEOF".to_vec()
        );
    }

    #[test]
    fn long_runs_split_at_the_record_limit() {
        let base = vec![0u8; 0x10010];
        let mut image = base.clone();
        for b in image.iter_mut().take(0x10005) {
            *b = 0xff;
        }
        let patch = encode(&base, &image);
        // one full record and the remainder
        assert_eq!(&patch[5..10], &[0, 0, 0, 0xff, 0xff]);
        let next = 10 + 0xffff;
        assert_eq!(&patch[next..next + 5], &[0, 0xff, 0xff, 0x00, 0x06]);
        assert_eq!(apply(&patch, &base), image);
    }

    #[test]
    fn eof_shaped_offsets_are_avoided() {
        let base = vec![0u8; EOF_OFFSET + 2];
        let mut image = base.clone();
        image[EOF_OFFSET] = 1;
        image[EOF_OFFSET + 1] = 2;
        let patch = encode(&base, &image);
        assert_eq!(&patch[5..8], &[0x45, 0x4f, 0x45]);
        assert_eq!(&patch[8..10], &[0, 3]);
        assert_eq!(&patch[10..13], &[0, 1, 2]);
        assert_eq!(apply(&patch, &base), image);
    }

    #[test]
    fn base_is_zero_extended() {
        let base = [0x00, 0x01];
        let image = [0x00, 0x01, 0x00, 0x05];
        let patch = encode(&base, &image);
        assert_eq!(
            patch,
            b"PATCH\x00\x00\x03\x00\x01\x05EOF".to_vec()
        );
    }
}
