//! Bit-exact wire format for Overbridge interrupt transfers.
//!
//! A transfer is `blocks_per_transfer` back-to-back blocks; a block is a
//! 32-byte header/counter/padding prefix followed by [`FRAMES_PER_BLOCK`]
//! frames of sample data. This module only knows how to turn bytes into
//! `f32`s and back — buffer sizing, scheduling and ring-buffer plumbing
//! live in [`crate::engine`].

use crate::device::TrackDesc;

/// Header magic stamped on every host → device (OUT) block.
pub const HEADER_H2O: u16 = 0x07FF;
/// Header magic expected on every device → host (IN) block.
pub const HEADER_O2H: u16 = 0x0700;

/// Frames carried by a single block, fixed by the hardware.
pub const FRAMES_PER_BLOCK: usize = 7;
/// Bytes of header + frame counter + reserved padding ahead of frame data.
pub const BLOCK_OVERHEAD_BYTES: usize = 32;
const PADDING_BYTES: usize = 28;

const HEADER_FIELD_BYTES: usize = 2;
const COUNTER_FIELD_BYTES: usize = 2;

/// Full-scale divisor for the 32-bit signed sample slot every track
/// conceptually fills, whether it puts 3 or 4 bytes on the wire.
const FULL_SCALE: f32 = i32::MAX as f32;

/// Size in bytes of one block carrying frames of `frame_bytes` width.
pub const fn block_bytes(frame_bytes: usize) -> usize {
    BLOCK_OVERHEAD_BYTES + FRAMES_PER_BLOCK * frame_bytes
}

/// Size in bytes of a full transfer of `blocks_per_transfer` blocks.
pub const fn transfer_bytes(blocks_per_transfer: usize, frame_bytes: usize) -> usize {
    blocks_per_transfer * block_bytes(frame_bytes)
}

/// Sum of a track list's per-sample byte widths — one frame's size.
pub fn frame_bytes(tracks: &[TrackDesc]) -> usize {
    tracks.iter().map(|t| t.sample_size as usize).sum()
}

fn decode_sample(raw: &[u8]) -> i32 {
    match raw.len() {
        4 => i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
        3 => i32::from_be_bytes([raw[0], raw[1], raw[2], 0]),
        n => unreachable!("unsupported sample width: {n}"),
    }
}

fn encode_sample(value: i32, sample_size: u8, out: &mut [u8]) {
    let be = value.to_be_bytes();
    match sample_size {
        4 => out.copy_from_slice(&be),
        3 => out.copy_from_slice(&be[..3]),
        n => unreachable!("unsupported sample width: {n}"),
    }
}

/// Decodes one block's frames into `out` (one `f32` per track per frame,
/// frame-major order) and returns the block's 16-bit frame counter.
///
/// `block` must be exactly `block_bytes(frame_bytes(tracks))` bytes long
/// and `out` exactly `FRAMES_PER_BLOCK * tracks.len()` elements; both are
/// invariants of the caller's pre-sized engine buffers, not user input, so
/// violations are a programmer error rather than a recoverable condition.
pub fn decode_block(block: &[u8], tracks: &[TrackDesc], out: &mut [f32]) -> u16 {
    let frame_sz = frame_bytes(tracks);
    debug_assert_eq!(block.len(), block_bytes(frame_sz));
    debug_assert_eq!(out.len(), FRAMES_PER_BLOCK * tracks.len());

    let counter = u16::from_be_bytes([
        block[HEADER_FIELD_BYTES],
        block[HEADER_FIELD_BYTES + 1],
    ]);

    let mut offset = BLOCK_OVERHEAD_BYTES;
    let mut idx = 0;
    for _ in 0..FRAMES_PER_BLOCK {
        for track in tracks {
            let sz = track.sample_size as usize;
            let raw = decode_sample(&block[offset..offset + sz]);
            out[idx] = raw as f32 / FULL_SCALE;
            offset += sz;
            idx += 1;
        }
    }
    counter
}

/// Encodes `FRAMES_PER_BLOCK` frames of `data` into `block`, stamping the
/// OUT header and `counter`. `data` is frame-major, one `f32` per track.
pub fn encode_block(block: &mut [u8], tracks: &[TrackDesc], counter: u16, data: &[f32]) {
    let frame_sz = frame_bytes(tracks);
    debug_assert_eq!(block.len(), block_bytes(frame_sz));
    debug_assert_eq!(data.len(), FRAMES_PER_BLOCK * tracks.len());

    block[0..HEADER_FIELD_BYTES].copy_from_slice(&HEADER_H2O.to_be_bytes());
    block[HEADER_FIELD_BYTES..HEADER_FIELD_BYTES + COUNTER_FIELD_BYTES]
        .copy_from_slice(&counter.to_be_bytes());
    for b in &mut block[HEADER_FIELD_BYTES + COUNTER_FIELD_BYTES..BLOCK_OVERHEAD_BYTES] {
        *b = 0;
    }
    debug_assert_eq!(PADDING_BYTES, BLOCK_OVERHEAD_BYTES - HEADER_FIELD_BYTES - COUNTER_FIELD_BYTES);

    let mut offset = BLOCK_OVERHEAD_BYTES;
    let mut idx = 0;
    for _ in 0..FRAMES_PER_BLOCK {
        for track in tracks {
            let sz = track.sample_size as usize;
            let value = (data[idx] * FULL_SCALE) as i32;
            encode_sample(value, track.sample_size, &mut block[offset..offset + sz]);
            offset += sz;
            idx += 1;
        }
    }
}

/// Decodes a full device → host transfer (`blocks_per_transfer` blocks)
/// into `out`, checking every block's header against [`HEADER_O2H`].
/// Returns `false` (and still decodes as much as it can) if any block's
/// header does not match — the engine counts this as a protocol error
/// rather than treating it as fatal.
pub fn decode_transfer(raw: &[u8], tracks: &[TrackDesc], blocks_per_transfer: usize, out: &mut [f32]) -> bool {
    let frame_sz = frame_bytes(tracks);
    let blk_sz = block_bytes(frame_sz);
    let frame_count = FRAMES_PER_BLOCK * tracks.len();
    let mut headers_ok = true;

    for i in 0..blocks_per_transfer {
        let block = &raw[i * blk_sz..(i + 1) * blk_sz];
        let header = u16::from_be_bytes([block[0], block[1]]);
        if header != HEADER_O2H {
            headers_ok = false;
        }
        decode_block(block, tracks, &mut out[i * frame_count..(i + 1) * frame_count]);
    }
    headers_ok
}

/// Encodes a full host → device transfer, advancing `counter` by
/// `FRAMES_PER_BLOCK` (mod 2^16) after each block, matching Testable
/// Property 2 (block k's counter equals block 0's counter + 7k mod 2^16).
pub fn encode_transfer(raw: &mut [u8], tracks: &[TrackDesc], blocks_per_transfer: usize, counter: &mut u16, data: &[f32]) {
    let frame_sz = frame_bytes(tracks);
    let blk_sz = block_bytes(frame_sz);
    let frame_count = FRAMES_PER_BLOCK * tracks.len();

    for i in 0..blocks_per_transfer {
        let block = &mut raw[i * blk_sz..(i + 1) * blk_sz];
        encode_block(block, tracks, *counter, &data[i * frame_count..(i + 1) * frame_count]);
        *counter = counter.wrapping_add(FRAMES_PER_BLOCK as u16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device;

    fn pattern(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| {
                let t = i as f32 / len as f32;
                (t * std::f32::consts::TAU * 3.0).sin() * 0.8
            })
            .collect()
    }

    #[test]
    fn round_trip_four_byte_tracks_is_exact_to_quantization() {
        let desc = device::lookup(0x000c).unwrap();
        let tracks = desc.output_tracks;
        let blocks_per_transfer = 4;
        let frame_count = FRAMES_PER_BLOCK * tracks.len() * blocks_per_transfer;
        let input = pattern(frame_count);

        let mut raw = vec![0u8; transfer_bytes(blocks_per_transfer, frame_bytes(tracks))];
        let mut counter = 0u16;
        encode_transfer(&mut raw, tracks, blocks_per_transfer, &mut counter, &input);

        // Re-header as an IN transfer so decode_transfer's header check passes.
        let blk_sz = block_bytes(frame_bytes(tracks));
        for i in 0..blocks_per_transfer {
            raw[i * blk_sz..i * blk_sz + 2].copy_from_slice(&HEADER_O2H.to_be_bytes());
        }

        let mut output = vec![0f32; frame_count];
        let headers_ok = decode_transfer(&raw, tracks, blocks_per_transfer, &mut output);
        assert!(headers_ok);

        for (a, b) in input.iter().zip(output.iter()) {
            assert!((a - b).abs() < 2f32.powi(-23), "expected {a}, got {b}");
        }
    }

    #[test]
    fn round_trip_three_byte_tracks_stays_within_quantization_error() {
        let three_byte = [TrackDesc { name: "L", sample_size: 3 }, TrackDesc { name: "R", sample_size: 3 }];
        let blocks_per_transfer = 4;
        let frame_count = FRAMES_PER_BLOCK * three_byte.len() * blocks_per_transfer;
        let input = pattern(frame_count);

        let mut raw = vec![0u8; transfer_bytes(blocks_per_transfer, frame_bytes(&three_byte))];
        let mut counter = 0u16;
        encode_transfer(&mut raw, &three_byte, blocks_per_transfer, &mut counter, &input);

        let blk_sz = block_bytes(frame_bytes(&three_byte));
        for i in 0..blocks_per_transfer {
            raw[i * blk_sz..i * blk_sz + 2].copy_from_slice(&HEADER_O2H.to_be_bytes());
        }

        let mut output = vec![0f32; frame_count];
        decode_transfer(&raw, &three_byte, blocks_per_transfer, &mut output);

        for (a, b) in input.iter().zip(output.iter()) {
            assert!((a - b).abs() < 2f32.powi(-23), "expected {a}, got {b}");
        }
    }

    #[test]
    fn frame_counter_increments_by_seven_per_block_mod_2_16() {
        let tracks: &[TrackDesc] = &[TrackDesc { name: "L", sample_size: 4 }];
        let blocks_per_transfer = 8;
        let frame_count = FRAMES_PER_BLOCK * tracks.len() * blocks_per_transfer;
        let data = vec![0f32; frame_count];

        let mut raw = vec![0u8; transfer_bytes(blocks_per_transfer, frame_bytes(tracks))];
        let mut counter = 0xFFFDu16; // forces a wraparound partway through
        let start = counter;
        encode_transfer(&mut raw, tracks, blocks_per_transfer, &mut counter, &data);

        let blk_sz = block_bytes(frame_bytes(tracks));
        for k in 0..blocks_per_transfer {
            let block = &raw[k * blk_sz..(k + 1) * blk_sz];
            let stamped = u16::from_be_bytes([block[2], block[3]]);
            let expected = start.wrapping_add((FRAMES_PER_BLOCK * k) as u16);
            assert_eq!(stamped, expected);
        }
    }

    #[test]
    fn out_blocks_are_stamped_with_the_h2o_header() {
        let tracks: &[TrackDesc] = &[TrackDesc { name: "L", sample_size: 4 }];
        let mut block = vec![0u8; block_bytes(frame_bytes(tracks))];
        let data = vec![0f32; FRAMES_PER_BLOCK];
        encode_block(&mut block, tracks, 0, &data);
        assert_eq!(u16::from_be_bytes([block[0], block[1]]), HEADER_H2O);
    }

    #[test]
    fn transfer_byte_count_matches_block_count_times_block_size() {
        let desc = device::lookup(0x0014).unwrap();
        let tracks = desc.output_tracks;
        let fb = frame_bytes(tracks);
        assert_eq!(block_bytes(fb), BLOCK_OVERHEAD_BYTES + FRAMES_PER_BLOCK * fb);
        assert_eq!(transfer_bytes(24, fb), 24 * block_bytes(fb));
    }
}
