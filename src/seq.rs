use anyhow::{Result, bail};
use std::fmt;
use std::ops::Range;

/// Nucleotide alphabet. `N` is fully ambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Base {
    A,
    C,
    G,
    T,
    N,
}

impl Base {
    pub const UNAMBIGUOUS: [Base; 4] = [Base::A, Base::C, Base::G, Base::T];

    pub fn from_byte(b: u8) -> Option<Base> {
        match b {
            b'A' | b'a' => Some(Base::A),
            b'C' | b'c' => Some(Base::C),
            b'G' | b'g' => Some(Base::G),
            b'T' | b't' => Some(Base::T),
            b'N' | b'n' => Some(Base::N),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Base::A => b'A',
            Base::C => b'C',
            Base::G => b'G',
            Base::T => b'T',
            Base::N => b'N',
        }
    }

    pub fn index(self) -> Option<usize> {
        match self {
            Base::A => Some(0),
            Base::C => Some(1),
            Base::G => Some(2),
            Base::T => Some(3),
            Base::N => None,
        }
    }

    pub fn from_index(i: usize) -> Option<Base> {
        Base::UNAMBIGUOUS.get(i).copied()
    }

    pub fn is_ambiguous(self) -> bool {
        self == Base::N
    }

    /// Leaf partial likelihood: an exact indicator of the observed base.
    /// The ambiguous base is all ones, so it acts as a multiplicative
    /// identity in pruning rather than a uniform 0.25 distribution.
    pub fn likelihood(self) -> [f64; 4] {
        match self.index() {
            Some(i) => {
                let mut v = [0.0; 4];
                v[i] = 1.0;
                v
            }
            None => [1.0; 4],
        }
    }

    pub fn fitch_set(self) -> u8 {
        match self.index() {
            Some(i) => 1 << i,
            None => 0b1111,
        }
    }
}

impl fmt::Display for Base {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_byte() as char)
    }
}

pub fn encode(seq: &str) -> Result<Vec<Base>> {
    let mut out = Vec::with_capacity(seq.len());
    for (i, b) in seq.bytes().enumerate() {
        match Base::from_byte(b) {
            Some(base) => out.push(base),
            None => bail!("unknown char '{}' (char code {}) at position {i}", b as char, b),
        }
    }
    Ok(out)
}

pub fn decode(seq: &[Base]) -> String {
    seq.iter().map(|b| b.to_byte() as char).collect()
}

/// Aligned sequences; row `i` is read by leaf `i` of every local tree.
#[derive(Debug, Clone, Default)]
pub struct Sequences {
    names: Vec<String>,
    seqs: Vec<Vec<Base>>,
}

impl Sequences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_strs(seqs: &[&str]) -> Result<Self> {
        let mut out = Self::new();
        for (i, s) in seqs.iter().enumerate() {
            out.push(format!("seq{i}"), s)?;
        }
        Ok(out)
    }

    pub fn push(&mut self, name: impl Into<String>, seq: &str) -> Result<()> {
        let name = name.into();
        check_seq_name(&name)?;
        let encoded = encode(seq)?;
        if let Some(first) = self.seqs.first()
            && first.len() != encoded.len()
        {
            bail!(
                "sequences are not the same length: {} != {}",
                first.len(),
                encoded.len()
            );
        }
        self.names.push(name);
        self.seqs.push(encoded);
        Ok(())
    }

    pub fn num_seqs(&self) -> usize {
        self.seqs.len()
    }

    pub fn len(&self) -> usize {
        self.seqs.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn row(&self, i: usize) -> &[Base] {
        &self.seqs[i]
    }

    pub fn view(&self, range: Range<usize>) -> Result<SeqView<'_>> {
        if range.start > range.end || range.end > self.len() {
            bail!(
                "site range {}..{} is outside alignment of length {}",
                range.start,
                range.end,
                self.len()
            );
        }
        Ok(SeqView {
            rows: self.seqs.iter().map(|s| &s[range.clone()]).collect(),
            len: range.end - range.start,
        })
    }

    pub fn full_view(&self) -> SeqView<'_> {
        SeqView {
            rows: self.seqs.iter().map(Vec::as_slice).collect(),
            len: self.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SeqView<'a> {
    rows: Vec<&'a [Base]>,
    len: usize,
}

impl<'a> SeqView<'a> {
    pub fn num_seqs(&self) -> usize {
        self.rows.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn base(&self, row: usize, site: usize) -> Base {
        self.rows[row][site]
    }

    /// True when every row carries the same unambiguous base.
    pub fn is_invariant_site(&self, site: usize) -> bool {
        let Some(first) = self.rows.first() else {
            return false;
        };
        let c = first[site];
        if c.is_ambiguous() {
            return false;
        }
        self.rows[1..].iter().all(|r| r[site] == c)
    }

    pub fn invariant_sites(&self) -> Vec<bool> {
        (0..self.len).map(|i| self.is_invariant_site(i)).collect()
    }
}

/// Sequence names: non-empty, no leading/trailing space, only
/// `[A-Za-z0-9_.- ]`, and not purely numeric.
pub fn check_seq_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name is zero length");
    }
    if name.starts_with(' ') || name.ends_with(' ') {
        bail!("name starts or ends with a space '{name}'");
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ' ')))
    {
        bail!("name contains illegal character '{c}'");
    }
    if name.chars().all(|c| c.is_ascii_digit()) {
        bail!("name is purely numeric '{name}'");
    }
    Ok(())
}
