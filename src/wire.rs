//! Little-endian primitives shared by the lattice and feature-vector codecs.
//!
//! Layout of an array record:
//!
//! ```text
//! [present: u8] [len: u32] [elements ...]
//! ```
//!
//! `present = 0` encodes an absent array and nothing follows. Nested arrays
//! are an outer array whose elements are themselves array records without the
//! redundant `present` byte.

use std::io::{Read, Write};

use crate::error::{Error, Result};

pub fn write_bool<W: Write>(w: &mut W, v: bool) -> Result<()> {
    w.write_all(&[v as u8])?;
    Ok(())
}

pub fn read_bool<R: Read>(r: &mut R) -> Result<bool> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0] != 0)
}

pub fn write_i64<W: Write>(w: &mut W, v: i64) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn read_i64<R: Read>(r: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

pub fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn write_i32<W: Write>(w: &mut W, v: i32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn read_i32<R: Read>(r: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub fn write_f64<W: Write>(w: &mut W, v: f64) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn read_f64<R: Read>(r: &mut R) -> Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

/// Checks a format-version tag at the head of a record. A mismatch is fatal
/// for the whole stream; there are no compatibility shims.
pub fn expect_version<R: Read>(r: &mut R, expected: i64) -> Result<()> {
    let found = read_i64(r)?;
    if found != expected {
        return Err(Error::VersionMismatch { expected, found });
    }
    Ok(())
}

pub fn write_u32_array<W: Write>(w: &mut W, v: &[u32]) -> Result<()> {
    write_bool(w, true)?;
    write_u32(w, v.len() as u32)?;
    for &x in v {
        write_u32(w, x)?;
    }
    Ok(())
}

pub fn read_u32_array<R: Read>(r: &mut R) -> Result<Vec<u32>> {
    if !read_bool(r)? {
        return Ok(Vec::new());
    }
    let n = read_u32(r)? as usize;
    let mut v = Vec::with_capacity(n);
    for _ in 0..n {
        v.push(read_u32(r)?);
    }
    Ok(v)
}

pub fn write_i32_array<W: Write>(w: &mut W, v: &[i32]) -> Result<()> {
    write_bool(w, true)?;
    write_u32(w, v.len() as u32)?;
    for &x in v {
        write_i32(w, x)?;
    }
    Ok(())
}

pub fn read_i32_array<R: Read>(r: &mut R) -> Result<Vec<i32>> {
    if !read_bool(r)? {
        return Ok(Vec::new());
    }
    let n = read_u32(r)? as usize;
    let mut v = Vec::with_capacity(n);
    for _ in 0..n {
        v.push(read_i32(r)?);
    }
    Ok(v)
}

pub fn write_f64_array<W: Write>(w: &mut W, v: &[f64]) -> Result<()> {
    write_bool(w, true)?;
    write_u32(w, v.len() as u32)?;
    for &x in v {
        write_f64(w, x)?;
    }
    Ok(())
}

pub fn read_f64_array<R: Read>(r: &mut R) -> Result<Vec<f64>> {
    if !read_bool(r)? {
        return Ok(Vec::new());
    }
    let n = read_u32(r)? as usize;
    let mut v = Vec::with_capacity(n);
    for _ in 0..n {
        v.push(read_f64(r)?);
    }
    Ok(v)
}

/// Adjacency lists are `[pos][state offset] -> edge indices`.
pub fn write_adjacency<W: Write>(w: &mut W, v: &[Vec<Vec<u32>>]) -> Result<()> {
    write_bool(w, !v.is_empty())?;
    if v.is_empty() {
        return Ok(());
    }
    write_u32(w, v.len() as u32)?;
    for states in v {
        write_u32(w, states.len() as u32)?;
        for edges in states {
            write_u32(w, edges.len() as u32)?;
            for &e in edges {
                write_u32(w, e)?;
            }
        }
    }
    Ok(())
}

pub fn read_adjacency<R: Read>(r: &mut R) -> Result<Vec<Vec<Vec<u32>>>> {
    if !read_bool(r)? {
        return Ok(Vec::new());
    }
    let n_pos = read_u32(r)? as usize;
    let mut v = Vec::with_capacity(n_pos);
    for _ in 0..n_pos {
        let n_states = read_u32(r)? as usize;
        let mut states = Vec::with_capacity(n_states);
        for _ in 0..n_states {
            let n_edges = read_u32(r)? as usize;
            let mut edges = Vec::with_capacity(n_edges);
            for _ in 0..n_edges {
                edges.push(read_u32(r)?);
            }
            states.push(edges);
        }
        v.push(states);
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let mut buf = Vec::new();
        write_i64(&mut buf, -42).unwrap();
        write_u32(&mut buf, 7).unwrap();
        write_i32(&mut buf, -1).unwrap();
        write_f64(&mut buf, 0.25).unwrap();
        write_bool(&mut buf, true).unwrap();
        let mut r = &buf[..];
        assert_eq!(read_i64(&mut r).unwrap(), -42);
        assert_eq!(read_u32(&mut r).unwrap(), 7);
        assert_eq!(read_i32(&mut r).unwrap(), -1);
        assert_eq!(read_f64(&mut r).unwrap(), 0.25);
        assert!(read_bool(&mut r).unwrap());
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let mut buf = Vec::new();
        write_i64(&mut buf, 3).unwrap();
        let mut r = &buf[..];
        match expect_version(&mut r, 4) {
            Err(Error::VersionMismatch { expected: 4, found: 3 }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn adjacency_round_trip() {
        let adj = vec![
            vec![vec![0, 1], vec![2]],
            vec![vec![], vec![3, 4, 5]],
        ];
        let mut buf = Vec::new();
        write_adjacency(&mut buf, &adj).unwrap();
        let mut r = &buf[..];
        assert_eq!(read_adjacency(&mut r).unwrap(), adj);
    }
}
