/// One labeled input sequence: surface forms plus (for training) the gold
/// label at every position. Labels are ids from the label `Quark`.
#[derive(Debug, Clone, Default)]
pub struct Sequence {
    pub id: u32,
    pub forms: Vec<String>,
    pub labels: Vec<u32>,
}

impl Sequence {
    pub fn new(id: u32, forms: Vec<String>, labels: Vec<u32>) -> Self {
        assert_eq!(
            forms.len(),
            labels.len(),
            "sequence {}: {} forms but {} labels",
            id,
            forms.len(),
            labels.len()
        );
        Self { id, forms, labels }
    }

    pub fn len(&self) -> usize {
        self.forms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forms.is_empty()
    }

    /// Hash of the concatenated forms, used to verify that a lattice loaded
    /// from storage belongs to this sequence. 31-multiplier rolling hash over
    /// the forms joined by single spaces, so it is stable across runs.
    pub fn content_hash(&self) -> u32 {
        let mut h: u32 = 0;
        for form in &self.forms {
            for b in form.bytes() {
                h = h.wrapping_mul(31).wrapping_add(b as u32);
            }
            h = h.wrapping_mul(31).wrapping_add(b' ' as u32);
        }
        h
    }
}
