//! Redis Cluster slot calculation.
//!
//! Redis Cluster uses CRC16 to map keys to slots (0-16383).
//! This module provides utilities for calculating slot numbers from keys
//! and for splitting multi-key requests into per-slot groups.

use std::collections::BTreeMap;

use crc::{Crc, CRC_16_XMODEM};

use crate::error::{Error, Result};

/// Number of hash slots in Redis Cluster.
pub const SLOT_COUNT: u16 = 16384;

/// CRC-16/XMODEM algorithm used by Redis.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Calculates the Redis Cluster slot for a given key.
///
/// Redis uses CRC16 modulo 16384 for slot calculation.
/// If the key contains `{...}`, only the content inside the braces
/// is used for hashing (hash tags).
///
/// # Arguments
///
/// * `key` - The key bytes to calculate the slot for
///
/// # Returns
///
/// The slot number (0-16383)
///
/// # Examples
///
/// ```
/// use slotmux::key_slot;
///
/// assert_eq!(key_slot("foo"), key_slot("foo"));
/// assert_eq!(key_slot("{user1000}.following"), key_slot("{user1000}.followers"));
/// assert_ne!(key_slot("user1000"), key_slot("user2000"));
/// ```
pub fn key_slot(key: impl AsRef<[u8]>) -> u16 {
    let hash_key = extract_hash_tag(key.as_ref());
    CRC16.checksum(hash_key) % SLOT_COUNT
}

/// Extracts the hash tag from a key.
///
/// Redis hash tags are defined by `{...}`:
/// - `{user1000}.following` → hash tag is `user1000`
/// - `foo{bar}baz` → hash tag is `bar`
/// - `foo{}{bar}` → first pair is empty, use whole key
/// - `foo` → no hash tag, use whole key
///
/// # Returns
///
/// The extracted hash tag, or the whole key if no valid hash tag exists
fn extract_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        let tag_start = start + 1;
        if let Some(len) = key[tag_start..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[tag_start..tag_start + len];
            }
        }
    }

    key
}

/// Validates that every key of a multi-key command maps to one slot.
///
/// # Returns
///
/// The shared slot.
///
/// # Errors
///
/// - `Error::Validation` if `keys` is empty
/// - `Error::CrossSlot` if the keys span more than one slot
pub fn ensure_same_slot<K: AsRef<[u8]>>(keys: &[K]) -> Result<u16> {
    let (first, rest) = keys
        .split_first()
        .ok_or_else(|| Error::validation("at least one key is required"))?;

    let slot = key_slot(first);
    if rest.iter().all(|key| key_slot(key) == slot) {
        Ok(slot)
    } else {
        Err(Error::CrossSlot)
    }
}

/// Groups keys by slot, keeping the relative order of keys within a group.
///
/// # Examples
///
/// ```
/// use slotmux::cluster::group_by_hash_slot;
///
/// let groups = group_by_hash_slot(["{a}1", "{b}1", "{a}2"]);
/// assert_eq!(groups.len(), 2);
/// assert!(groups.values().any(|g| g == &vec!["{a}1", "{a}2"]));
/// ```
pub fn group_by_hash_slot<K, I>(keys: I) -> BTreeMap<u16, Vec<K>>
where
    K: AsRef<[u8]>,
    I: IntoIterator<Item = K>,
{
    let mut groups: BTreeMap<u16, Vec<K>> = BTreeMap::new();
    for key in keys {
        groups.entry(key_slot(&key)).or_default().push(key);
    }
    groups
}

/// Groups an alternating `key, value, key, value, ...` sequence by key slot.
///
/// Pairs keep their relative order within a group.
///
/// # Errors
///
/// Returns `Error::Validation` when the sequence has an odd length.
pub fn group_by_key_value_hash_slot<K, I>(keys_values: I) -> Result<BTreeMap<u16, Vec<(K, K)>>>
where
    K: AsRef<[u8]>,
    I: IntoIterator<Item = K>,
{
    let mut groups: BTreeMap<u16, Vec<(K, K)>> = BTreeMap::new();
    let mut iter = keys_values.into_iter();
    while let Some(key) = iter.next() {
        let value = iter
            .next()
            .ok_or_else(|| Error::validation("keysvalues must contain an even number of elements"))?;
        groups.entry(key_slot(&key)).or_default().push((key, value));
    }
    Ok(groups)
}
