use std::io::{Read, Write};

use crate::error::Result;
use crate::wire;

/// Format-version tag written ahead of every serialized feature vector.
pub const FEATURE_VECTOR_VERSION: i64 = 2;

/// Sparse feature vector: an ordered run of feature ids with an optional
/// parallel run of real values. `vals` may be shorter than `keys`; keys
/// without an explicit value are binary (implicit weight 1.0). Immutable
/// once built.
///
/// Two addressing modes are supported against a dense weight array:
/// direct (`score`/`increment`, key plus block offset) and mixed
/// (`score_mixed`/`increment_mixed`), which hashes the offset key into a
/// fixed-capacity array when the exact feature space is too large to
/// materialize.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureVector {
    keys: Vec<u32>,
    vals: Vec<f64>,
}

/// Hash for mixed addressing. Must stay in lockstep between scoring and
/// incrementing or the two will touch different weights.
#[inline]
fn mix(key: usize, capacity: usize) -> usize {
    (key as u64).wrapping_mul(31) as usize % capacity
}

impl FeatureVector {
    /// All-binary vector (no explicit values).
    pub fn binary(keys: Vec<u32>) -> Self {
        Self { keys, vals: Vec::new() }
    }

    /// Vector with explicit values for the first `vals.len()` keys; any
    /// remaining keys are binary.
    pub fn with_values(keys: Vec<u32>, vals: Vec<f64>) -> Self {
        assert!(
            vals.len() <= keys.len(),
            "{} values for {} keys",
            vals.len(),
            keys.len()
        );
        Self { keys, vals }
    }

    pub fn keys(&self) -> &[u32] {
        &self.keys
    }

    pub fn values(&self) -> &[f64] {
        &self.vals
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[inline]
    fn val(&self, i: usize) -> f64 {
        if i < self.vals.len() {
            self.vals[i]
        } else {
            1.0
        }
    }

    /// Dot product against `w`, each key shifted by `offset`.
    pub fn score(&self, w: &[f64], offset: usize) -> f64 {
        let mut s = 0.0;
        for (i, &k) in self.keys.iter().enumerate() {
            s += self.val(i) * w[k as usize + offset];
        }
        s
    }

    /// Dot product with hashed addressing into a capacity-bounded array.
    pub fn score_mixed(&self, w: &[f64], offset: usize) -> f64 {
        let mut s = 0.0;
        for (i, &k) in self.keys.iter().enumerate() {
            s += self.val(i) * w[mix(k as usize + offset, w.len())];
        }
        s
    }

    /// Scaled accumulation `w[key + offset] += val * rate`.
    pub fn increment(&self, w: &mut [f64], offset: usize, rate: f64) {
        for (i, &k) in self.keys.iter().enumerate() {
            w[k as usize + offset] += self.val(i) * rate;
        }
    }

    /// Scaled accumulation with hashed addressing.
    pub fn increment_mixed(&self, w: &mut [f64], offset: usize, rate: f64) {
        let cap = w.len();
        for (i, &k) in self.keys.iter().enumerate() {
            w[mix(k as usize + offset, cap)] += self.val(i) * rate;
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        wire::write_i64(w, FEATURE_VECTOR_VERSION)?;
        wire::write_u32_array(w, &self.keys)?;
        wire::write_f64_array(w, &self.vals)?;
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        wire::expect_version(r, FEATURE_VECTOR_VERSION)?;
        let keys = wire::read_u32_array(r)?;
        let vals = wire::read_f64_array(r)?;
        Ok(Self { keys, vals })
    }
}

pub(crate) fn write_feature_vectors<W: Write>(
    w: &mut W,
    fvs: &Option<Vec<FeatureVector>>,
) -> Result<()> {
    match fvs {
        None => wire::write_bool(w, false),
        Some(v) => {
            wire::write_bool(w, true)?;
            wire::write_u32(w, v.len() as u32)?;
            for fv in v {
                fv.write(w)?;
            }
            Ok(())
        }
    }
}

pub(crate) fn read_feature_vectors<R: Read>(r: &mut R) -> Result<Option<Vec<FeatureVector>>> {
    if !wire::read_bool(r)? {
        return Ok(None);
    }
    let n = wire::read_u32(r)? as usize;
    let mut v = Vec::with_capacity(n);
    for _ in 0..n {
        v.push(FeatureVector::read(r)?);
    }
    Ok(Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_score_and_increment() {
        let fv = FeatureVector::binary(vec![0, 2]);
        let mut w = vec![1.0, 10.0, 3.0, 0.0];
        assert_eq!(fv.score(&w, 0), 4.0);
        assert_eq!(fv.score(&w, 1), 10.0);

        fv.increment(&mut w, 0, 0.5);
        assert_eq!(w, vec![1.5, 10.0, 3.5, 0.0]);
    }

    #[test]
    fn trailing_keys_are_binary() {
        let fv = FeatureVector::with_values(vec![0, 1, 2], vec![2.0]);
        let w = vec![1.0, 1.0, 1.0];
        // 2.0 * 1.0 + 1.0 + 1.0
        assert_eq!(fv.score(&w, 0), 4.0);
    }

    #[test]
    fn mixed_addressing_is_consistent() {
        let fv = FeatureVector::binary(vec![3, 900, 12345]);
        let mut w = vec![0.0; 64];
        fv.increment_mixed(&mut w, 7, 2.0);
        assert_eq!(fv.score_mixed(&w, 7), 6.0);
        // a different offset lands on (mostly) different slots
        assert_ne!(fv.score_mixed(&w, 8), 6.0);
    }

    #[test]
    fn codec_round_trip() {
        let fv = FeatureVector::with_values(vec![5, 9, 100], vec![0.25, -1.5]);
        let mut buf = Vec::new();
        fv.write(&mut buf).unwrap();
        let back = FeatureVector::read(&mut &buf[..]).unwrap();
        assert_eq!(fv, back);
    }

    #[test]
    fn optional_array_codec() {
        let fvs = Some(vec![
            FeatureVector::binary(vec![1]),
            FeatureVector::default(),
        ]);
        let mut buf = Vec::new();
        write_feature_vectors(&mut buf, &fvs).unwrap();
        write_feature_vectors(&mut buf, &None).unwrap();
        let mut r = &buf[..];
        assert_eq!(read_feature_vectors(&mut r).unwrap(), fvs);
        assert_eq!(read_feature_vectors(&mut r).unwrap(), None);
    }
}
