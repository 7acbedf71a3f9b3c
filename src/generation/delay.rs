//! Delay-pattern codec.
//!
//! Each codebook's timeline is shifted forward by a per-codebook offset
//! before the model sees it, so that within one physical step every codebook
//! conditions on already-decided neighbours from earlier steps. `delay`
//! produces that physically offset form, `undelay` restores logical
//! alignment and reports which positions carry real content.
//!
//! Both directions exist twice: on [`TokenGrid`]s for the generation loop,
//! and on `(batch, codebooks, steps, vocab)` logit tensors for scoring.

use anyhow::{ensure, Result};
use candle_core::{IndexOp, Tensor};

use crate::tokens::{Token, TokenGrid};

/// Boolean array parallel to a `(batch, codebooks, steps)` grid; a position
/// is true when the undelayed value at that position is real content rather
/// than spillover from the delay undo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidityMask {
    data: Vec<bool>,
    batch: usize,
    codebooks: usize,
    steps: usize,
}

impl ValidityMask {
    fn filled(batch: usize, codebooks: usize, steps: usize, value: bool) -> Self {
        Self {
            data: vec![value; batch * codebooks * steps],
            batch,
            codebooks,
            steps,
        }
    }

    fn set(&mut self, b: usize, k: usize, t: usize, value: bool) {
        self.data[(b * self.codebooks + k) * self.steps + t] = value;
    }

    pub fn get(&self, b: usize, k: usize, t: usize) -> bool {
        self.data[(b * self.codebooks + k) * self.steps + t]
    }

    /// True when every position up to `steps` (exclusive) is valid.
    pub fn all_valid_until(&self, steps: usize) -> bool {
        (0..self.batch).all(|b| {
            (0..self.codebooks).all(|k| (0..steps.min(self.steps)).all(|t| self.get(b, k, t)))
        })
    }

    pub fn all_valid(&self) -> bool {
        self.data.iter().all(|&v| v)
    }
}

/// Shift every codebook timeline forward by its delay, filling the opened
/// prefix with that codebook's initial token.
///
/// Requires one delay and one initial token per codebook.
pub fn delay_grid(codes: &TokenGrid, delays: &[usize], initial: &[Token]) -> Result<TokenGrid> {
    let (batch, codebooks, steps) = (codes.batch(), codes.codebooks(), codes.steps());
    ensure!(
        delays.len() == codebooks,
        "{} delays for {} codebooks",
        delays.len(),
        codebooks
    );
    ensure!(
        initial.len() == codebooks,
        "{} initial tokens for {} codebooks",
        initial.len(),
        codebooks
    );
    let mut out = TokenGrid::filled(batch, codebooks, steps, Token::Ungenerated);
    for b in 0..batch {
        for (k, &d) in delays.iter().enumerate() {
            for t in 0..steps {
                let token = if t < d {
                    initial[k]
                } else {
                    codes.get(b, k, t - d)
                };
                out.set(b, k, t, token);
            }
        }
    }
    Ok(out)
}

/// Undo [`delay_grid`]: shift each codebook back by its delay, fill the
/// trailing positions (which have no source) with `fill` and mark them
/// invalid. With all delays zero this is the identity with an all-true mask.
pub fn undelay_grid(
    codes: &TokenGrid,
    delays: &[usize],
    fill: Token,
) -> Result<(TokenGrid, ValidityMask)> {
    let (batch, codebooks, steps) = (codes.batch(), codes.codebooks(), codes.steps());
    ensure!(
        delays.len() == codebooks,
        "{} delays for {} codebooks",
        delays.len(),
        codebooks
    );
    if delays.iter().all(|&d| d == 0) {
        return Ok((
            codes.clone(),
            ValidityMask::filled(batch, codebooks, steps, true),
        ));
    }
    let mut out = TokenGrid::filled(batch, codebooks, steps, fill);
    let mut mask = ValidityMask::filled(batch, codebooks, steps, false);
    for b in 0..batch {
        for (k, &d) in delays.iter().enumerate() {
            for t in 0..steps.saturating_sub(d) {
                out.set(b, k, t, codes.get(b, k, t + d));
                mask.set(b, k, t, true);
            }
        }
    }
    Ok((out, mask))
}

/// Undo the delay pattern on a `(batch, codebooks, steps, vocab)` logits
/// tensor, filling positions with no source with `fill_value` (typically
/// NaN so accidental use is loud). Also returns the `(batch, codebooks,
/// steps)` validity mask as a `u8` tensor.
pub fn undelay_logits(
    logits: &Tensor,
    delays: &[usize],
    fill_value: f32,
) -> Result<(Tensor, Tensor)> {
    let (batch, codebooks, steps, vocab) = logits.dims4()?;
    ensure!(
        delays.len() == codebooks,
        "{} delays for {} codebooks",
        delays.len(),
        codebooks
    );
    let device = logits.device();
    if delays.iter().all(|&d| d == 0) {
        let mask = Tensor::ones((batch, codebooks, steps), candle_core::DType::U8, device)?;
        return Ok((logits.clone(), mask));
    }
    let mut lines = Vec::with_capacity(codebooks);
    let mut masks = Vec::with_capacity(codebooks);
    for (k, &d) in delays.iter().enumerate() {
        let line = logits.i((.., k))?; // (batch, steps, vocab)
        let d = d.min(steps);
        let kept = steps - d;
        let shifted = if d == 0 {
            line
        } else if kept == 0 {
            Tensor::full(fill_value, (batch, steps, vocab), device)?.to_dtype(line.dtype())?
        } else {
            let valid = line.narrow(1, d, kept)?;
            let tail =
                Tensor::full(fill_value, (batch, d, vocab), device)?.to_dtype(line.dtype())?;
            Tensor::cat(&[&valid, &tail], 1)?
        };
        lines.push(shifted);
        let mut flags = vec![1u8; kept];
        flags.resize(steps, 0);
        let flags = Tensor::from_vec(flags, (1, steps), device)?
            .broadcast_as((batch, steps))?
            .contiguous()?;
        masks.push(flags);
    }
    let values = Tensor::stack(&lines, 1)?;
    let mask = Tensor::stack(&masks, 1)?;
    Ok((values, mask))
}
