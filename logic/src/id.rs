use std::fmt::Debug;
use std::ops::{BitAnd, BitOr, BitXor, Not};

use itertools::izip;
use rand::{
    distributions::{Distribution, Standard},
    Rng,
};

use crate::consts::ID_LEN;

/// Opaque 160-bit node/key identifier.
///
/// Distance between two ids is their bitwise XOR, interpreted as an unsigned
/// big-endian integer; the derived [`Ord`] on the byte array already matches
/// that ordering, so sorting by distance is just sorting by `a ^ target`.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Id(#[cfg_attr(feature = "serde", serde(with = "serde_bytes_array"))] pub [u8; ID_LEN]);

impl Id {
    pub const ZERO: Id = Id([0u8; ID_LEN]);

    /// Draws a uniformly random id, the `newID()` of the external interface.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Id {
        rng.gen()
    }

    /// Decodes a hex string into an id, left-aligning the decoded bytes (most
    /// significant first) and zero-filling the remainder. Shorter strings are
    /// thus prefixes of the id, which is what bucket-range doctests want.
    pub fn from_hex(s: &str) -> Id {
        let bytes = hex::decode(s).expect("invalid hex id");
        assert!(bytes.len() <= ID_LEN, "hex id longer than {ID_LEN} bytes");
        let mut data = [0u8; ID_LEN];
        data[..bytes.len()].copy_from_slice(&bytes);
        Id(data)
    }

    pub fn as_short_hex(&self) -> String {
        let hex_id = hex::encode(self.0);
        let trimmed = hex_id.trim_start_matches('0');
        if trimmed.is_empty() {
            "0".to_owned()
        } else {
            trimmed.to_owned()
        }
    }

    /// Number of leading zero bits, used as a common-prefix-length /
    /// bucket-index measure: `(a ^ b).leading_zeros()` is how many leading
    /// bits `a` and `b` share.
    pub fn leading_zeros(&self) -> u32 {
        let mut res = 0u32;
        for byte in self.0 {
            if byte == 0 {
                res += 8;
            } else {
                res += byte.leading_zeros();
                break;
            }
        }
        res
    }

    /// Returns the bit at position `i` (0 = most significant bit).
    pub fn bit(&self, i: usize) -> bool {
        let byte = self.0[i / 8];
        let mask = 1u8 << (7 - (i % 8));
        byte & mask != 0
    }

    /// Returns a copy of `self` with bit `i` (0 = most significant) set.
    pub fn set_bit(&self, i: usize) -> Id {
        let mut res = *self;
        res.0[i / 8] |= 1u8 << (7 - (i % 8));
        res
    }

    /// Mask with the first `bits` (most significant) bits set to one and the
    /// rest zero. `bits` may range from 0 (all zero) to [`crate::consts::ID_LEN_BITS`]
    /// (all one).
    pub fn create_left_mask(bits: usize) -> Id {
        let bits = bits.min(ID_LEN * 8);
        let mut data = [0u8; ID_LEN];
        let full_bytes = bits / 8;
        data[..full_bytes].fill(0xFF);
        let rem = bits % 8;
        if rem > 0 {
            data[full_bytes] = 0xFFu8 << (8 - rem);
        }
        Id(data)
    }
}

impl BitXor for Id {
    type Output = Id;

    fn bitxor(self, rhs: Id) -> Id {
        let mut res = Id::ZERO;
        for (a, b, r) in izip!(&self.0, &rhs.0, &mut res.0) {
            *r = a ^ b;
        }
        res
    }
}

impl BitAnd for Id {
    type Output = Id;

    fn bitand(self, rhs: Id) -> Id {
        let mut res = Id::ZERO;
        for (a, b, r) in izip!(&self.0, &rhs.0, &mut res.0) {
            *r = a & b;
        }
        res
    }
}

impl BitOr for Id {
    type Output = Id;

    fn bitor(self, rhs: Id) -> Id {
        let mut res = Id::ZERO;
        for (a, b, r) in izip!(&self.0, &rhs.0, &mut res.0) {
            *r = a | b;
        }
        res
    }
}

impl Not for Id {
    type Output = Id;

    fn not(self) -> Id {
        let mut res = Id::ZERO;
        for (a, r) in self.0.iter().zip(&mut res.0) {
            *r = !a;
        }
        res
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Id").field(&self.as_short_hex()).finish()
    }
}

impl Distribution<Id> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Id {
        let mut data = [0u8; ID_LEN];
        rng.fill_bytes(&mut data);
        Id(data)
    }
}

/// An inclusive range over the id space, represented as a fixed prefix of
/// `depth` bits plus "don't care" for the rest — exactly the shape of a
/// Kademlia bucket range, and exactly what bucket splitting produces: a split
/// always just grows the prefix by one bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdRange {
    prefix: Id,
    depth: usize,
}

impl IdRange {
    /// The whole id space: `[0, 2^160)`.
    pub const FULL: IdRange = IdRange {
        prefix: Id::ZERO,
        depth: 0,
    };

    /// Builds a range from an already-computed prefix and depth. Used when
    /// the caller has derived the prefix bits itself, e.g. bootstrap's
    /// sibling-range construction while walking up from the deepest shared
    /// prefix with the first node it discovers.
    pub fn with_prefix(prefix: Id, depth: usize) -> IdRange {
        IdRange { prefix, depth }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn min(&self) -> Id {
        self.prefix & Id::create_left_mask(self.depth)
    }

    pub fn max(&self) -> Id {
        self.prefix | !Id::create_left_mask(self.depth)
    }

    pub fn contains(&self, id: Id) -> bool {
        (self.prefix ^ id).leading_zeros() as usize >= self.depth
    }

    /// Splits this range in half at its midpoint bit, returning (low, high).
    pub fn split(&self) -> (IdRange, IdRange) {
        let child_depth = self.depth + 1;
        let low = IdRange {
            prefix: self.prefix,
            depth: child_depth,
        };
        let high = IdRange {
            prefix: self.prefix.set_bit(self.depth),
            depth: child_depth,
        };
        (low, high)
    }

    /// Draws a uniformly random id from within this range.
    pub fn sample_uniform<R: Rng + ?Sized>(&self, rng: &mut R) -> Id {
        let mask = Id::create_left_mask(self.depth);
        (Id::random(rng) & !mask) | (self.prefix & mask)
    }
}

#[cfg(feature = "serde")]
mod serde_bytes_array {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::consts::ID_LEN;

    pub fn serialize<S: Serializer>(data: &[u8; ID_LEN], ser: S) -> Result<S::Ok, S::Error> {
        hex::encode(data).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; ID_LEN], D::Error> {
        let s = String::deserialize(de)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        if bytes.len() != ID_LEN {
            return Err(serde::de::Error::custom("invalid id length"));
        }
        let mut res = [0u8; ID_LEN];
        res.copy_from_slice(&bytes);
        Ok(res)
    }
}
