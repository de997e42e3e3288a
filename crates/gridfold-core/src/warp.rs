//! Type-generic lane shuffles over the word-exchange intrinsic.

use bytemuck::Pod;

use crate::scope::ThreadScope;

/// Largest value size (bytes) the shuffle helpers move.
pub const MAX_SHUFFLE_BYTES: usize = 16;

#[inline]
fn shuffle_words<T: Pod>(scope: &(dyn ThreadScope + '_), value: T, src_lane: u32) -> T {
    let size = std::mem::size_of::<T>();
    debug_assert!(size <= MAX_SHUFFLE_BYTES);

    let mut bytes = [0u8; MAX_SHUFFLE_BYTES];
    bytes[..size].copy_from_slice(bytemuck::bytes_of(&value));

    // One collective word exchange per 32-bit slice of T.
    let words = size.div_ceil(4);
    for w in 0..words {
        let chunk: [u8; 4] = bytes[w * 4..w * 4 + 4].try_into().unwrap();
        let got = scope.shuffle_word(u32::from_ne_bytes(chunk), src_lane);
        bytes[w * 4..w * 4 + 4].copy_from_slice(&got.to_ne_bytes());
    }

    bytemuck::pod_read_unaligned(&bytes[..size])
}

/// Return the value held by lane `lane_id ^ mask`.
///
/// Collective over the warp. If the partner lane does not exist the result
/// is unspecified; callers on ragged blocks must guard the fold.
#[inline]
pub fn shuffle_xor<T: Pod>(scope: &(dyn ThreadScope + '_), value: T, mask: u32) -> T {
    let src = scope.lane_id() ^ mask;
    shuffle_words(scope, value, src)
}

/// Return the value held by lane `src_lane` (taken modulo the warp size).
#[inline]
pub fn shuffle_indexed<T: Pod>(scope: &(dyn ThreadScope + '_), value: T, src_lane: u32) -> T {
    shuffle_words(scope, value, src_lane)
}

/// True iff every byte of `v` is zero.
///
/// Used by the atomic grid path to decide whether the zero-initialized
/// accumulator already holds the operator identity.
#[inline]
pub fn is_bitwise_zero<T: Pod>(v: &T) -> bool {
    bytemuck::bytes_of(v).iter().all(|b| *b == 0)
}
