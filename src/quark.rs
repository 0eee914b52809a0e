use std::collections::HashMap;

/// Bijective mapping between strings and dense ids. Reverse lookup is plain
/// array indexing. The table owns its id space; nothing else allocates ids.
#[derive(Debug, Default, Clone)]
pub struct Quark {
    v: Vec<String>,
    m: HashMap<String, u32>,
    stopped: bool,
}

impl Quark {
    pub fn to_str(&self, id: u32) -> Option<&str> {
        self.v.get(id as usize).map(|x| x.as_str())
    }

    pub fn to_id(&self, s: &str) -> Option<u32> {
        self.m.get(s).copied()
    }

    pub fn len(&self) -> usize {
        self.v.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v.is_empty()
    }

    /// Returns the id for `key`, allocating a fresh one unless growth has
    /// been stopped, in which case unknown keys map to `None`.
    pub fn find_or_insert(&mut self, key: &str) -> Option<u32> {
        if let Some(&id) = self.m.get(key) {
            return Some(id);
        }
        if self.stopped {
            return None;
        }
        let id = self.v.len() as u32;
        self.m.insert(key.to_string(), id);
        self.v.push(key.to_string());
        Some(id)
    }

    /// Freezes the id space. Lookups still work; insertions of new keys fail.
    pub fn stop_growth(&mut self) {
        self.stopped = true;
    }

    pub fn growth_stopped(&self) -> bool {
        self.stopped
    }
}

impl From<Vec<String>> for Quark {
    fn from(v: Vec<String>) -> Self {
        let m = v
            .iter()
            .enumerate()
            .map(|(i, s)| (s.to_string(), i as u32))
            .collect();
        Self { v, m, stopped: false }
    }
}

/// A `Quark` that also tracks how often each key was interned, for filtering
/// rare items out of a label or feature space.
#[derive(Debug, Default, Clone)]
pub struct CountingQuark {
    inner: Quark,
    counts: Vec<u64>,
    /// Extra mappings installed by `remap_infrequent`; they alias existing
    /// ids without growing the table.
    aliases: HashMap<String, u32>,
}

impl CountingQuark {
    pub fn find_or_insert(&mut self, key: &str) -> Option<u32> {
        if let Some(&id) = self.aliases.get(key) {
            return Some(id);
        }
        let id = self.inner.find_or_insert(key)?;
        if !self.inner.growth_stopped() {
            if self.counts.len() <= id as usize {
                self.counts.resize(id as usize + 1, 0);
            }
            self.counts[id as usize] += 1;
        }
        Some(id)
    }

    pub fn count(&self, key: &str) -> Option<u64> {
        let id = self.to_id(key)?;
        self.counts.get(id as usize).copied()
    }

    pub fn to_id(&self, key: &str) -> Option<u32> {
        self.aliases.get(key).copied().or_else(|| self.inner.to_id(key))
    }

    pub fn to_str(&self, id: u32) -> Option<&str> {
        self.inner.to_str(id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn stop_growth(&mut self) {
        self.inner.stop_growth();
    }

    /// Builds a new table keeping only keys seen more than `cutoff` times;
    /// every dropped key is aliased to `junk_key`, so lookups of rare items
    /// keep resolving without growing the id space.
    pub fn remap_infrequent(&self, cutoff: u64, junk_key: &str) -> CountingQuark {
        let mut out = CountingQuark::default();
        for id in 0..self.len() as u32 {
            if self.counts[id as usize] > cutoff {
                let kept = out
                    .inner
                    .find_or_insert(self.to_str(id).unwrap())
                    .unwrap();
                if out.counts.len() <= kept as usize {
                    out.counts.resize(kept as usize + 1, 0);
                }
                out.counts[kept as usize] = self.counts[id as usize];
            }
        }
        let junk = out.inner.find_or_insert(junk_key).unwrap();
        out.stop_growth();
        for id in 0..self.len() as u32 {
            if self.counts[id as usize] <= cutoff {
                out.aliases.insert(self.to_str(id).unwrap().to_string(), junk);
            }
        }
        out
    }
}
