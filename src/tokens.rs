//! Token values and multi-codebook sequence buffers.
//!
//! A model step produces one token per parallel stream ("codebook"): the
//! audio residual streams, plus an optional text stream that always sits at
//! codebook index 0 when modeled. Besides ordinary vocabulary entries, three
//! special values flow through the decoding engine; they are kept as a typed
//! enum here and only collapse to sentinel integers when a tensor is built.

use anyhow::{bail, ensure, Result};
use candle_core::{Device, Tensor};

/// One entry of a codebook stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    /// An ordinary vocabulary entry in `[0, cardinality)`.
    Value(u32),
    /// Start-of-sequence marker; embeds as the extra row appended to each
    /// embedding table (row index `cardinality`).
    Start,
    /// "No value here": embeds to a zero vector and is never sampled. Used
    /// to blank out the streams of a modality that is not being generated.
    Zero,
    /// Placeholder for positions the generation loop has not decided yet.
    /// Never embedded; feeding it to the model is an internal logic fault.
    Ungenerated,
}

impl Token {
    /// Sentinel id for [`Token::Zero`] in tensor form.
    pub const ZERO_ID: i64 = -1;
    /// Sentinel id for [`Token::Ungenerated`] in tensor form.
    pub const UNGENERATED_ID: i64 = -2;

    /// Collapse to the integer encoding used at the tensor boundary.
    ///
    /// `cardinality` is the stream's vocabulary size; the start marker maps
    /// to `cardinality` itself (the extra embedding row).
    pub fn to_id(self, cardinality: usize) -> i64 {
        match self {
            Token::Value(v) => v as i64,
            Token::Start => cardinality as i64,
            Token::Zero => Self::ZERO_ID,
            Token::Ungenerated => Self::UNGENERATED_ID,
        }
    }

    /// Inverse of [`Token::to_id`]. Ids above `cardinality` are rejected.
    pub fn from_id(id: i64, cardinality: usize) -> Result<Self> {
        match id {
            Self::UNGENERATED_ID => Ok(Token::Ungenerated),
            Self::ZERO_ID => Ok(Token::Zero),
            v if v >= 0 && (v as usize) < cardinality => Ok(Token::Value(v as u32)),
            v if v as usize == cardinality => Ok(Token::Start),
            v => bail!("token id {v} outside [-2, {cardinality}]"),
        }
    }

    pub fn is_ungenerated(self) -> bool {
        self == Token::Ungenerated
    }

    /// The vocabulary index, if this is an ordinary entry.
    pub fn value(self) -> Option<u32> {
        match self {
            Token::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// Which streams a call generates (or scores).
///
/// Streams of the other modality still occupy their codebook rows but are
/// filled with [`Token::Zero`] and do not contribute to the input embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Audio,
    Text,
    Both,
}

impl Modality {
    pub fn generates_audio(self) -> bool {
        matches!(self, Modality::Audio | Modality::Both)
    }

    pub fn generates_text(self) -> bool {
        matches!(self, Modality::Text | Modality::Both)
    }
}

/// A dense `(batch, codebooks, steps)` buffer of tokens.
///
/// This is the logical (codebook-aligned) form unless a function says
/// otherwise; the delay codec in [`crate::generation::delay`] converts to and from the
/// physically offset form the model consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrid {
    data: Vec<Token>,
    batch: usize,
    codebooks: usize,
    steps: usize,
}

impl TokenGrid {
    /// A grid with every position set to `fill`.
    pub fn filled(batch: usize, codebooks: usize, steps: usize, fill: Token) -> Self {
        Self {
            data: vec![fill; batch * codebooks * steps],
            batch,
            codebooks,
            steps,
        }
    }

    /// Build from a nested `[batch][codebook][step]` layout.
    pub fn from_rows(rows: Vec<Vec<Vec<Token>>>) -> Result<Self> {
        let batch = rows.len();
        ensure!(batch > 0, "token grid needs at least one batch row");
        let codebooks = rows[0].len();
        ensure!(codebooks > 0, "token grid needs at least one codebook");
        let steps = rows[0].first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(batch * codebooks * steps);
        for row in &rows {
            ensure!(row.len() == codebooks, "ragged codebook axis");
            for line in row {
                ensure!(line.len() == steps, "ragged time axis");
                data.extend_from_slice(line);
            }
        }
        Ok(Self {
            data,
            batch,
            codebooks,
            steps,
        })
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn codebooks(&self) -> usize {
        self.codebooks
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    fn index(&self, b: usize, k: usize, t: usize) -> usize {
        debug_assert!(b < self.batch && k < self.codebooks && t < self.steps);
        (b * self.codebooks + k) * self.steps + t
    }

    pub fn get(&self, b: usize, k: usize, t: usize) -> Token {
        self.data[self.index(b, k, t)]
    }

    pub fn set(&mut self, b: usize, k: usize, t: usize, token: Token) {
        let i = self.index(b, k, t);
        self.data[i] = token;
    }

    /// Copy of the `[start, start + len)` time window.
    pub fn slice_steps(&self, start: usize, len: usize) -> Result<TokenGrid> {
        ensure!(
            start + len <= self.steps,
            "time window {start}..{} exceeds {} steps",
            start + len,
            self.steps
        );
        let mut out = TokenGrid::filled(self.batch, self.codebooks, len, Token::Ungenerated);
        for b in 0..self.batch {
            for k in 0..self.codebooks {
                for t in 0..len {
                    out.set(b, k, t, self.get(b, k, start + t));
                }
            }
        }
        Ok(out)
    }

    /// New grid with `column[k]` inserted at time 0 for every batch row.
    pub fn prepend_column(&self, column: &[Token]) -> Result<TokenGrid> {
        ensure!(
            column.len() == self.codebooks,
            "column has {} entries for {} codebooks",
            column.len(),
            self.codebooks
        );
        let mut out = TokenGrid::filled(
            self.batch,
            self.codebooks,
            self.steps + 1,
            Token::Ungenerated,
        );
        for b in 0..self.batch {
            for k in 0..self.codebooks {
                out.set(b, k, 0, column[k]);
                for t in 0..self.steps {
                    out.set(b, k, t + 1, self.get(b, k, t));
                }
            }
        }
        Ok(out)
    }

    pub fn any(&self, pred: impl Fn(Token) -> bool) -> bool {
        self.data.iter().copied().any(pred)
    }

    /// Earliest time step at which any batch row or codebook matches `pred`.
    pub fn first_step_where(&self, pred: impl Fn(Token) -> bool) -> Option<usize> {
        (0..self.steps).find(|&t| {
            (0..self.batch).any(|b| (0..self.codebooks).any(|k| pred(self.get(b, k, t))))
        })
    }

    /// Encode to an `i64` tensor of shape `(batch, codebooks, steps)`.
    ///
    /// `cardinalities` gives the vocabulary size per codebook and determines
    /// each stream's start-marker id.
    pub fn to_tensor(&self, cardinalities: &[usize], device: &Device) -> Result<Tensor> {
        ensure!(
            cardinalities.len() == self.codebooks,
            "{} cardinalities for {} codebooks",
            cardinalities.len(),
            self.codebooks
        );
        let mut ids = Vec::with_capacity(self.data.len());
        for b in 0..self.batch {
            for (k, &card) in cardinalities.iter().enumerate() {
                for t in 0..self.steps {
                    ids.push(self.get(b, k, t).to_id(card));
                }
            }
        }
        Ok(Tensor::from_vec(
            ids,
            (self.batch, self.codebooks, self.steps),
            device,
        )?)
    }

    /// Decode an `i64` tensor of shape `(batch, codebooks, steps)`.
    pub fn from_tensor(tensor: &Tensor, cardinalities: &[usize]) -> Result<TokenGrid> {
        let (batch, codebooks, steps) = tensor.dims3()?;
        ensure!(
            cardinalities.len() == codebooks,
            "{} cardinalities for {} codebooks",
            cardinalities.len(),
            codebooks
        );
        let ids = tensor.to_vec3::<i64>()?;
        let mut grid = TokenGrid::filled(batch, codebooks, steps, Token::Ungenerated);
        for (b, row) in ids.iter().enumerate() {
            for (k, line) in row.iter().enumerate() {
                for (t, &id) in line.iter().enumerate() {
                    grid.set(b, k, t, Token::from_id(id, cardinalities[k])?);
                }
            }
        }
        Ok(grid)
    }
}
