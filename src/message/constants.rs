//! Wire-format constants.

use crate::multisig;

/// Byte width of the session's block hash.
pub const BLOCK_HASH_SIZE: usize = 32;

/// Byte width of a compressed commit point on the wire.
pub const COMMIT_POINT_SIZE: usize = multisig::POINT_SIZE;

/// Byte width of a compressed public key on the wire.
pub const PUB_KEY_SIZE: usize = multisig::POINT_SIZE;

/// Byte width of a challenge scalar on the wire.
pub const CHALLENGE_SIZE: usize = multisig::SCALAR_SIZE;

/// Byte width of a response scalar on the wire.
pub const RESPONSE_SIZE: usize = multisig::SCALAR_SIZE;

/// Byte width of a signature on the wire.
pub const SIGNATURE_SIZE: usize = multisig::SIGNATURE_SIZE;

/// Byte width of the fixed header every body starts with:
/// `[u32 consensus id][block hash][u16 participant id]`.
pub const HEADER_SIZE: usize = 4 + BLOCK_HASH_SIZE + 2;
