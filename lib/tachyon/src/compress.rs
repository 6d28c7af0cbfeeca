//! LZ4-style block compression used by the packet transformers. Blocks are
//! framed with an 8-byte header carrying the original length and the total
//! compressed length including the header itself.

use byteorder::{ByteOrder, LittleEndian};

/// Length header preceding every compressed block:
/// `original_len: i32 LE || compressed_len_including_header: i32 LE`.
pub const HEADER_SIZE: usize = 8;

const HASH_TABLE_SIZE: usize = 1 << 16;
const HASH_MULTIPLIER: u32 = 2_654_435_761;
const MIN_MATCH: usize = 4;
const MAX_OFFSET: usize = 65_535;
// Standard LZ4 block end rules: no match may extend into the final five
// bytes and the stream always ends on a literal run.
const LAST_LITERALS: usize = 5;
// Inputs below this size cannot contain a conforming match.
const MIN_COMPRESS_INPUT: usize = 13;

#[derive(Debug, Eq, PartialEq)]
pub enum CompressError {
    /// Input too large for the 32-bit length header.
    TooLarge(usize),
}

#[derive(Debug, Eq, PartialEq)]
pub enum DecompressError {
    /// Missing or self-inconsistent length header.
    BadHeader,
    /// The block ends mid-sequence.
    Truncated,
    /// Offsets or lengths that contradict the declared original size.
    Malformed,
}

#[inline]
fn hash(sequence: u32) -> usize {
    (sequence.wrapping_mul(HASH_MULTIPLIER) >> 16) as usize
}

/// Compresses `input` into a framed block. Incompressible data degrades to
/// a single literal run with the fixed header overhead.
pub fn compress(input: &[u8]) -> Result<Vec<u8>, CompressError> {
    if input.len() > i32::max_value() as usize - HEADER_SIZE {
        return Err(CompressError::TooLarge(input.len()));
    }

    let mut out = Vec::with_capacity(HEADER_SIZE + input.len() + input.len() / 255 + 16);
    out.extend_from_slice(&[0u8; HEADER_SIZE]);

    compress_body(input, &mut out);

    let total = out.len() as i32;
    LittleEndian::write_i32(&mut out[0..4], input.len() as i32);
    LittleEndian::write_i32(&mut out[4..8], total);

    Ok(out)
}

fn compress_body(src: &[u8], out: &mut Vec<u8>) {
    let n = src.len();

    if n == 0 {
        return;
    }

    if n < MIN_COMPRESS_INPUT {
        emit_sequence(out, src, None);
        return;
    }

    // Slots store position + 1 so zero doubles as the empty marker
    let mut table = vec![0u32; HASH_TABLE_SIZE];

    let match_limit = n - LAST_LITERALS;
    let mut anchor = 0;
    let mut pos = 0;

    while pos + MIN_MATCH <= match_limit {
        let sequence = LittleEndian::read_u32(&src[pos..]);
        let slot = hash(sequence);
        let candidate = table[slot] as usize;
        table[slot] = (pos + 1) as u32;

        if candidate > 0 {
            let cand = candidate - 1;

            if pos - cand <= MAX_OFFSET && LittleEndian::read_u32(&src[cand..]) == sequence {
                let mut len = MIN_MATCH;
                while pos + len < match_limit && src[cand + len] == src[pos + len] {
                    len += 1;
                }

                emit_sequence(out, &src[anchor..pos], Some(((pos - cand) as u16, len)));

                pos += len;
                anchor = pos;
                continue;
            }
        }

        pos += 1;
    }

    emit_sequence(out, &src[anchor..n], None);
}

/// Writes one token + literals [+ offset + extended match length] sequence.
fn emit_sequence(out: &mut Vec<u8>, literals: &[u8], matched: Option<(u16, usize)>) {
    let lit_len = literals.len();
    let match_code = matched.map(|(_, len)| len - MIN_MATCH);

    let lit_nibble = if lit_len >= 15 { 15 } else { lit_len as u8 };
    let match_nibble = match match_code {
        Some(code) if code >= 15 => 15,
        Some(code) => code as u8,
        None => 0,
    };

    out.push((lit_nibble << 4) | match_nibble);

    if lit_len >= 15 {
        write_extended_len(out, lit_len - 15);
    }

    out.extend_from_slice(literals);

    if let Some((offset, _)) = matched {
        out.push(offset as u8);
        out.push((offset >> 8) as u8);

        if let Some(code) = match_code {
            if code >= 15 {
                write_extended_len(out, code - 15);
            }
        }
    }
}

/// Lengths above the 4-bit nibble extend with `0xff` runs closed by a byte
/// below `0xff`.
fn write_extended_len(out: &mut Vec<u8>, mut remainder: usize) {
    while remainder >= 255 {
        out.push(255);
        remainder -= 255;
    }

    out.push(remainder as u8);
}

/// Decompresses a framed block produced by `compress`. Overlapping match
/// copies replicate forward byte-by-byte, which is what makes short-offset
/// runs expand correctly.
pub fn decompress(input: &[u8]) -> Result<Vec<u8>, DecompressError> {
    if input.len() < HEADER_SIZE {
        return Err(DecompressError::BadHeader);
    }

    let original = LittleEndian::read_i32(&input[0..4]);
    let compressed = LittleEndian::read_i32(&input[4..8]);

    if original < 0 || compressed < 0 || compressed as usize != input.len() {
        return Err(DecompressError::BadHeader);
    }

    let original = original as usize;
    let mut out = Vec::with_capacity(original);
    let mut i = HEADER_SIZE;

    while i < input.len() {
        let token = input[i];
        i += 1;

        let mut lit_len = (token >> 4) as usize;
        if lit_len == 15 {
            lit_len += read_extended_len(input, &mut i)?;
        }

        if i + lit_len > input.len() {
            return Err(DecompressError::Truncated);
        }
        if out.len() + lit_len > original {
            return Err(DecompressError::Malformed);
        }

        out.extend_from_slice(&input[i..i + lit_len]);
        i += lit_len;

        // The final sequence carries no match part
        if i == input.len() {
            break;
        }

        if i + 2 > input.len() {
            return Err(DecompressError::Truncated);
        }

        let offset = LittleEndian::read_u16(&input[i..]) as usize;
        i += 2;

        if offset == 0 || offset > out.len() {
            return Err(DecompressError::Malformed);
        }

        let mut match_len = (token & 0x0f) as usize;
        if match_len == 15 {
            match_len += read_extended_len(input, &mut i)?;
        }
        match_len += MIN_MATCH;

        if out.len() + match_len > original {
            return Err(DecompressError::Malformed);
        }

        let start = out.len() - offset;
        for k in 0..match_len {
            let byte = out[start + k];
            out.push(byte);
        }
    }

    if out.len() != original {
        return Err(DecompressError::Malformed);
    }

    Ok(out)
}

fn read_extended_len(input: &[u8], i: &mut usize) -> Result<usize, DecompressError> {
    let mut total = 0usize;

    loop {
        if *i >= input.len() {
            return Err(DecompressError::Truncated);
        }

        let byte = input[*i];
        *i += 1;
        total += byte as usize;

        if byte < 255 {
            return Ok(total);
        }

        if total > i32::max_value() as usize {
            return Err(DecompressError::Malformed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, RngCore, SeedableRng};

    fn roundtrip(input: &[u8]) {
        let compressed = compress(input).unwrap();
        let output = decompress(&compressed).unwrap();
        assert_eq!(&output[..], input);
    }

    #[test]
    fn test_roundtrip_empty() {
        let compressed = compress(&[]).unwrap();
        assert_eq!(compressed.len(), HEADER_SIZE);
        assert_eq!(decompress(&compressed).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_roundtrip_short_inputs() {
        for len in 1..MIN_COMPRESS_INPUT + 4 {
            let input: Vec<u8> = (0..len as u8).collect();
            roundtrip(&input);
        }
    }

    #[test]
    fn test_roundtrip_repetitive() {
        roundtrip(&vec![0u8; 65536]);
        roundtrip(&b"abcabcabcabcabcabcabcabcabcabcabcabc"[..]);
        roundtrip(&b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"[..]);
    }

    #[test]
    fn test_roundtrip_long_runs_compress() {
        let input = vec![0x5au8; 10_000];
        let compressed = compress(&input).unwrap();

        assert!(compressed.len() < input.len() / 10);
        assert_eq!(decompress(&compressed).unwrap(), input);
    }

    #[test]
    fn test_roundtrip_random_incompressible() {
        let mut rng = StdRng::seed_from_u64(0x7ac4_401d);

        let mut input = vec![0u8; 10_240];
        rng.fill_bytes(&mut input);

        let compressed = compress(&input).unwrap();
        assert_eq!(decompress(&compressed).unwrap(), input);
    }

    #[test]
    fn test_roundtrip_mixed_entropy() {
        let mut rng = StdRng::seed_from_u64(0x00c0_ffee);
        let mut input = Vec::new();

        for _ in 0..64 {
            if rng.gen_bool(0.5) {
                let byte: u8 = rng.gen();
                let run = rng.gen_range(4..400);
                input.extend(std::iter::repeat(byte).take(run));
            } else {
                let run = rng.gen_range(4..120);
                input.extend((0..run).map(|_| rng.gen::<u8>()));
            }
        }

        roundtrip(&input);
    }

    #[test]
    fn test_header_fields() {
        let input = b"header field check input data";
        let compressed = compress(input).unwrap();

        assert_eq!(LittleEndian::read_i32(&compressed[0..4]) as usize, input.len());
        assert_eq!(LittleEndian::read_i32(&compressed[4..8]) as usize, compressed.len());
    }

    #[test]
    fn test_overlapping_copy_semantics() {
        // A two-byte period repeated: matches reference bytes produced by
        // the same match, exercising the forward-copy path
        let input: Vec<u8> = std::iter::repeat(&b"ab"[..]).take(500).flatten().copied().collect();
        roundtrip(&input);
    }

    #[test]
    fn test_decompress_rejects_missing_header() {
        assert_eq!(decompress(&[1, 2, 3]), Err(DecompressError::BadHeader));
    }

    #[test]
    fn test_decompress_rejects_length_mismatch() {
        let mut compressed = compress(b"some payload data here").unwrap();
        compressed.pop();

        assert_eq!(decompress(&compressed), Err(DecompressError::BadHeader));
    }

    #[test]
    fn test_decompress_rejects_tampered_original_len() {
        let mut compressed = compress(b"some payload data here").unwrap();
        LittleEndian::write_i32(&mut compressed[0..4], 5);

        assert!(decompress(&compressed).is_err());
    }

    #[test]
    fn test_decompress_rejects_bad_offset() {
        // Token demanding a match against an empty output window
        let mut block = vec![0u8; HEADER_SIZE];
        block.push(0x04); // no literals, match_len 4 + 4
        block.push(0x01); // offset 1 with nothing produced yet
        block.push(0x00);

        let total = block.len() as i32;
        LittleEndian::write_i32(&mut block[0..4], 8);
        LittleEndian::write_i32(&mut block[4..8], total);

        assert_eq!(decompress(&block), Err(DecompressError::Malformed));
    }
}
