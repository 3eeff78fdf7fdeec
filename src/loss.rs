//! Masked multi-codebook cross-entropy
//!
//! The backbone predicts codebook 0 of the next frame; the decoder predicts
//! codebooks `1..n` from the backbone state followed by the embeddings of the
//! lower codebooks. Each codebook contributes its masked mean cross-entropy
//! weighted by `1 / n_audio_codebooks`.

use candle_core::{DType, Tensor, D};

use crate::error::{FinetuneError, Result};
use crate::model::SpeechModel;

/// Compute the training loss for a `(tokens, masks)` batch.
///
/// `tokens` is `[batch, seq, n_audio_codebooks + 1]` with the text slot last,
/// `masks` has the same shape and marks valid positions with 1. A codebook whose
/// target mask sums to zero yields a non-finite loss.
pub fn compute_loss<M>(model: &M, tokens: &Tensor, masks: &Tensor) -> Result<Tensor>
where
    M: SpeechModel + ?Sized,
{
    let n_audio = model.n_audio_codebooks();
    let (_batch, seq_len, slots) = tokens.dims3()?;
    if slots != n_audio + 1 {
        return Err(FinetuneError::invalid_batch(format!(
            "expected {} token slots ({} audio codebooks + text), got {}",
            n_audio + 1,
            n_audio,
            slots
        )));
    }
    if masks.dims() != tokens.dims() {
        return Err(FinetuneError::shape_mismatch("masks", tokens.dims(), masks.dims()));
    }
    if seq_len < 2 {
        return Err(FinetuneError::invalid_batch(format!(
            "need at least 2 timesteps to form next-step targets, got {}",
            seq_len
        )));
    }
    let steps = seq_len - 1;

    let audio_tokens = tokens.narrow(2, 0, n_audio)?;
    let audio_masks = masks.narrow(2, 0, n_audio)?;

    // Padded slots contribute nothing to the per-timestep sum
    let embeds = model.embed_tokens(tokens)?;
    let slot_mask = masks.to_dtype(embeds.dtype())?.unsqueeze(3)?;
    let backbone_input = embeds.broadcast_mul(&slot_mask)?.sum(2)?;

    let backbone_hidden = model.backbone(&backbone_input)?;
    let shifted_backbone_hidden = backbone_hidden.narrow(1, 0, steps)?;

    let c0_logits = model.codebook0_head(&backbone_hidden)?.narrow(1, 0, steps)?;

    let target_tokens = audio_tokens.narrow(1, 1, steps)?;
    let target_masks = audio_masks.narrow(1, 1, steps)?;

    let weight = 1.0 / n_audio as f64;
    let c0_loss = masked_cross_entropy(
        &c0_logits,
        &codebook(&target_tokens, 0)?,
        &codebook(&target_masks, 0)?,
    )?;
    let mut total_loss = c0_loss.affine(weight, 0.0)?;

    if n_audio > 1 {
        let mut positions = Vec::with_capacity(n_audio);
        positions.push(shifted_backbone_hidden.unsqueeze(2)?);
        for index in 0..n_audio - 1 {
            let ids = codebook(&audio_tokens, index)?.narrow(1, 0, steps)?;
            positions.push(model.embed_audio(index, &ids)?.unsqueeze(2)?);
        }
        // (batch, seq - 1, backbone activation + codebooks 0..n-2, dim)
        let decoder_inputs = Tensor::cat(&positions, 2)?.contiguous()?;

        // Position 0 is the backbone activation slot, not a prediction
        let decoder_hidden = model
            .decoder(&model.projection(&decoder_inputs)?)?
            .narrow(2, 1, n_audio - 1)?;

        for index in 1..n_audio {
            let hidden = decoder_hidden.narrow(2, index - 1, 1)?.squeeze(2)?.contiguous()?;
            let ci_logits = hidden.broadcast_matmul(model.audio_head(index - 1)?)?;
            let ci_loss = masked_cross_entropy(
                &ci_logits,
                &codebook(&target_tokens, index)?,
                &codebook(&target_masks, index)?,
            )?;
            total_loss = total_loss.add(&ci_loss.affine(weight, 0.0)?)?;
        }
    }

    Ok(total_loss)
}

/// Cross-entropy averaged over positions where `mask` is 1.
///
/// `logits` is `[.., vocab]`, `targets` and `mask` match its leading axes.
/// Returns a scalar. Targets at masked-out positions are ignored, so padding
/// may hold any id.
pub fn masked_cross_entropy(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let vocab = logits.dim(D::Minus1)?;
    let rows = logits.elem_count() / vocab;
    if targets.elem_count() != rows || mask.elem_count() != rows {
        return Err(FinetuneError::invalid_batch(format!(
            "{} logit rows but {} targets and {} mask entries",
            rows,
            targets.elem_count(),
            mask.elem_count()
        )));
    }

    let logits = logits.reshape((rows, vocab))?;
    let mask = mask.flatten_all()?.to_dtype(logits.dtype())?;

    // Gather needs an in-range id at every row, masked or not
    let targets = targets.flatten_all()?.to_dtype(DType::U32)?;
    let keep = mask.ne(&mask.zeros_like()?)?;
    let targets = keep
        .where_cond(&targets, &targets.zeros_like()?)?
        .unsqueeze(1)?
        .contiguous()?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let nll = log_probs.gather(&targets, 1)?.squeeze(1)?.neg()?;

    let masked_sum = nll.mul(&mask)?.sum_all()?;
    Ok(masked_sum.div(&mask.sum_all()?)?)
}

/// Select one codebook column of a `[batch, seq, codebooks]` tensor
fn codebook(t: &Tensor, index: usize) -> Result<Tensor> {
    Ok(t.narrow(2, index, 1)?.squeeze(2)?)
}
