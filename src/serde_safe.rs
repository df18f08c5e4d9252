//! Bounded containers for network deserialization.
//!
//! Wire payloads decode through [`BoundedVec`] and [`BoundedBytes`] so a
//! malicious length prefix can never allocate past the declared limit. The
//! bound is enforced inside the serde visitor, before any oversized
//! collection exists in memory.

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::fmt;
use std::marker::PhantomData;

/// Vec wrapper whose deserializer refuses more than `N` elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedVec<T, const N: usize>(Vec<T>);

impl<T, const N: usize> BoundedVec<T, N> {
    pub fn new(v: Vec<T>) -> Option<Self> {
        (v.len() <= N).then_some(Self(v))
    }

    /// Caller must ensure len <= N.
    #[inline]
    pub fn new_unchecked(v: Vec<T>) -> Self {
        debug_assert!(v.len() <= N);
        Self(v)
    }

    pub fn into_inner(self) -> Vec<T> {
        self.0
    }
}

impl<T, const N: usize> Default for BoundedVec<T, N> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T, const N: usize> std::ops::Deref for BoundedVec<T, N> {
    type Target = Vec<T>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: Serialize, const N: usize> Serialize for BoundedVec<T, N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>, const N: usize> Deserialize<'de> for BoundedVec<T, N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor<T, const N: usize>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>, const N: usize> de::Visitor<'de> for Visitor<T, N> {
            type Value = BoundedVec<T, N>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a sequence of at most {} elements", N)
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let hint = seq.size_hint().unwrap_or(0);
                if hint > N {
                    return Err(de::Error::invalid_length(hint, &self));
                }
                let mut v = Vec::with_capacity(hint.min(N));
                while let Some(elem) = seq.next_element()? {
                    if v.len() >= N {
                        return Err(de::Error::invalid_length(v.len() + 1, &self));
                    }
                    v.push(elem);
                }
                Ok(BoundedVec(v))
            }
        }

        deserializer.deserialize_seq(Visitor(PhantomData))
    }
}

/// Byte buffer wrapper whose deserializer refuses more than `N` bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundedBytes<const N: usize>(Vec<u8>);

impl<const N: usize> BoundedBytes<N> {
    pub fn new(v: Vec<u8>) -> Option<Self> {
        (v.len() <= N).then_some(Self(v))
    }

    /// Caller must ensure len <= N.
    #[inline]
    pub fn new_unchecked(v: Vec<u8>) -> Self {
        debug_assert!(v.len() <= N);
        Self(v)
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl<const N: usize> std::ops::Deref for BoundedBytes<N> {
    type Target = Vec<u8>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<const N: usize> Serialize for BoundedBytes<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de, const N: usize> Deserialize<'de> for BoundedBytes<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor<const N: usize>;

        impl<'de, const N: usize> de::Visitor<'de> for Visitor<N> {
            type Value = BoundedBytes<N>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "at most {} bytes", N)
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                if v.len() > N {
                    return Err(de::Error::invalid_length(v.len(), &self));
                }
                Ok(BoundedBytes(v.to_vec()))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let hint = seq.size_hint().unwrap_or(0);
                if hint > N {
                    return Err(de::Error::invalid_length(hint, &self));
                }
                let mut v = Vec::with_capacity(hint.min(N));
                while let Some(byte) = seq.next_element()? {
                    if v.len() >= N {
                        return Err(de::Error::invalid_length(v.len() + 1, &self));
                    }
                    v.push(byte);
                }
                Ok(BoundedBytes(v))
            }
        }

        deserializer.deserialize_bytes(Visitor)
    }
}

/// Serialize for the wire with postcard.
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, postcard::Error> {
    postcard::to_allocvec(value)
}

/// Deserialize from the wire with postcard.
pub fn from_bytes<'de, T: Deserialize<'de>>(data: &'de [u8]) -> Result<T, postcard::Error> {
    postcard::from_bytes(data)
}
