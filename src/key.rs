//! Binary key grammar over the ordered keyspace.
//!
//! Every key starts with the tree name followed by a one byte subkey tag:
//!
//! ```bnf
//! key     = name subkey
//! subkey  = 0x01 id ival                 data store (item body)
//!         | 0x02 ival                    i index (ival -> head key)
//!         | 0x03 id version              head index (-> opts byte + ival)
//!         | 0x04 version                 version index (-> data store key)
//!         | 0x05 string                  user store (arbitrary bytes)
//! string  = len byte* 0x00               len counts the trailing NUL
//! lbeint  = len byte*                    1..254 big-endian unsigned bytes
//! ```
//!
//! Keys sort lexicographically in the store. The length byte of an lbeint
//! sorts shorter encodings before longer ones, so minimally encoded integers
//! keep their numeric order and ikey range scans walk insertion order.

use crate::error::Error;
use anyhow::Result;

pub const DSKEY: u8 = 0x01;
pub const IKEY: u8 = 0x02;
pub const HEADKEY: u8 = 0x03;
pub const VKEY: u8 = 0x04;
pub const USKEY: u8 = 0x05;

/// Conflict bit of the opts byte stored in head index values.
pub const OPT_CONFLICT: u8 = 0x01;

/// Maximum value of a string or lbeint length byte.
pub const MAX_LEN: usize = 254;

/// Checks a tree or perspective name: ASCII, no NUL, and it must fit the
/// length byte with its trailing NUL.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() + 1 > MAX_LEN {
        return Err(Error::InvalidItem(format!("name length {} out of bounds", name.len())).into());
    }
    if !name.is_ascii() || name.bytes().any(|b| b == 0) {
        return Err(Error::InvalidItem(format!("name {:?} not ascii without NUL", name)).into());
    }
    Ok(())
}

/// Checks an id: opaque bytes, no NUL, bounded by the length byte.
pub fn validate_id(id: &[u8]) -> Result<()> {
    if id.is_empty() || id.len() + 1 > MAX_LEN {
        return Err(Error::InvalidItem(format!("id length {} out of bounds", id.len())).into());
    }
    if id.contains(&0) {
        return Err(Error::InvalidItem("id contains NUL".into()).into());
    }
    Ok(())
}

fn push_string(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.push((bytes.len() + 1) as u8);
    buf.extend_from_slice(bytes);
    buf.push(0);
}

fn push_lbeint(buf: &mut Vec<u8>, i: u64) {
    let be = i.to_be_bytes();
    let skip = be.iter().take_while(|b| **b == 0).count().min(7);
    buf.push((8 - skip) as u8);
    buf.extend_from_slice(&be[skip..]);
}

fn push_version(buf: &mut Vec<u8>, v: &[u8]) {
    buf.push(v.len() as u8);
    buf.extend_from_slice(v);
}

fn read_string(buf: &[u8]) -> Result<(&[u8], &[u8])> {
    let len = *buf.first().ok_or_else(|| bad_key(buf))? as usize;
    if len < 1 || buf.len() < 1 + len || buf[len] != 0 {
        return Err(bad_key(buf));
    }
    Ok((&buf[1..len], &buf[1 + len..]))
}

fn read_lbeint(buf: &[u8]) -> Result<(u64, &[u8])> {
    let len = *buf.first().ok_or_else(|| bad_key(buf))? as usize;
    if len < 1 || len > 8 || buf.len() < 1 + len {
        return Err(bad_key(buf));
    }
    let mut be = [0; 8];
    be[8 - len..].copy_from_slice(&buf[1..1 + len]);
    Ok((u64::from_be_bytes(be), &buf[1 + len..]))
}

fn read_version(buf: &[u8]) -> Result<(&[u8], &[u8])> {
    let len = *buf.first().ok_or_else(|| bad_key(buf))? as usize;
    if len < 1 || buf.len() < 1 + len {
        return Err(bad_key(buf));
    }
    Ok((&buf[1..1 + len], &buf[1 + len..]))
}

fn bad_key(buf: &[u8]) -> anyhow::Error {
    Error::InvalidItem(format!("malformed key bytes {}", hex::encode(buf))).into()
}

/// Prefix of all keys of one tree with the given subkey tag.
pub fn prefix(name: &str, tag: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(name.len() + 3);
    push_string(&mut buf, name.as_bytes());
    buf.push(tag);
    buf
}

/// Key of the serialized item with insertion index `i`.
pub fn ds_key(name: &str, id: &[u8], i: u64) -> Vec<u8> {
    let mut buf = prefix(name, DSKEY);
    push_string(&mut buf, id);
    push_lbeint(&mut buf, i);
    buf
}

/// Prefix of all data store keys of one id, in insertion order.
pub fn ds_prefix(name: &str, id: &[u8]) -> Vec<u8> {
    let mut buf = prefix(name, DSKEY);
    push_string(&mut buf, id);
    buf
}

/// Key of the i index entry for insertion index `i`.
pub fn i_key(name: &str, i: u64) -> Vec<u8> {
    let mut buf = prefix(name, IKEY);
    push_lbeint(&mut buf, i);
    buf
}

/// Prefix of the whole i index of a tree, in insertion order.
pub fn i_prefix(name: &str) -> Vec<u8> {
    prefix(name, IKEY)
}

/// Key of the head index entry of (id, version).
pub fn head_key(name: &str, id: &[u8], version: &[u8]) -> Vec<u8> {
    let mut buf = prefix(name, HEADKEY);
    push_string(&mut buf, id);
    push_version(&mut buf, version);
    buf
}

/// Prefix of all head index entries of one id.
pub fn head_prefix(name: &str, id: &[u8]) -> Vec<u8> {
    let mut buf = prefix(name, HEADKEY);
    push_string(&mut buf, id);
    buf
}

/// Key of the version index entry of `version`.
pub fn v_key(name: &str, version: &[u8]) -> Vec<u8> {
    let mut buf = prefix(name, VKEY);
    push_version(&mut buf, version);
    buf
}

/// Key of a user store entry.
pub fn us_key(name: &str, user: &[u8]) -> Vec<u8> {
    let mut buf = prefix(name, USKEY);
    push_string(&mut buf, user);
    buf
}

fn strip_prefix<'a>(name: &str, tag: u8, key: &'a [u8]) -> Result<&'a [u8]> {
    let (n, rest) = read_string(key)?;
    if n != name.as_bytes() {
        return Err(bad_key(key));
    }
    match rest.split_first() {
        Some((t, rest)) if *t == tag => Ok(rest),
        _ => Err(bad_key(key)),
    }
}

/// Parses a data store key back into its id and insertion index.
pub fn parse_ds_key<'a>(name: &str, key: &'a [u8]) -> Result<(&'a [u8], u64)> {
    let rest = strip_prefix(name, DSKEY, key)?;
    let (id, rest) = read_string(rest)?;
    let (i, rest) = read_lbeint(rest)?;
    if !rest.is_empty() {
        return Err(bad_key(key));
    }
    Ok((id, i))
}

/// Parses an i index key back into its insertion index.
pub fn parse_i_key(name: &str, key: &[u8]) -> Result<u64> {
    let rest = strip_prefix(name, IKEY, key)?;
    let (i, rest) = read_lbeint(rest)?;
    if !rest.is_empty() {
        return Err(bad_key(key));
    }
    Ok(i)
}

/// Parses a head index key back into its id and version.
pub fn parse_head_key<'a>(name: &str, key: &'a [u8]) -> Result<(&'a [u8], &'a [u8])> {
    let rest = strip_prefix(name, HEADKEY, key)?;
    let (id, rest) = read_string(rest)?;
    let (version, rest) = read_version(rest)?;
    if !rest.is_empty() {
        return Err(bad_key(key));
    }
    Ok((id, version))
}

/// Parses a user store key back into the user supplied bytes.
pub fn parse_us_key<'a>(name: &str, key: &'a [u8]) -> Result<&'a [u8]> {
    let rest = strip_prefix(name, USKEY, key)?;
    let (user, rest) = read_string(rest)?;
    if !rest.is_empty() {
        return Err(bad_key(key));
    }
    Ok(user)
}

/// Value stored under a head index key.
pub fn head_value(conflict: bool, i: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.push(if conflict { OPT_CONFLICT } else { 0 });
    push_lbeint(&mut buf, i);
    buf
}

/// Parses a head index value into its conflict flag and insertion index.
pub fn parse_head_value(value: &[u8]) -> Result<(bool, u64)> {
    let (opts, rest) = value.split_first().ok_or_else(|| bad_key(value))?;
    let (i, rest) = read_lbeint(rest)?;
    if !rest.is_empty() {
        return Err(bad_key(value));
    }
    Ok((opts & OPT_CONFLICT != 0, i))
}
