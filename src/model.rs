//! Model interface consumed by the loss and the trainer

use candle_core::Tensor;
use std::path::Path;

use crate::error::Result;
use crate::params::ParamTree;

/// A backbone/decoder speech model over residual audio codebooks.
///
/// Token tensors carry `n_audio_codebooks() + 1` slots on their last axis: one
/// per audio codebook followed by the text slot.
pub trait SpeechModel {
    /// Number of audio codebooks (residual quantizer levels)
    fn n_audio_codebooks(&self) -> usize;

    /// Embed every slot of `[batch, seq, codebooks + 1]` tokens into
    /// `[batch, seq, codebooks + 1, dim]`
    fn embed_tokens(&self, tokens: &Tensor) -> Result<Tensor>;

    /// Embed `[batch, seq]` ids of a single audio codebook into `[batch, seq, dim]`
    fn embed_audio(&self, codebook: usize, tokens: &Tensor) -> Result<Tensor>;

    /// Shared backbone transform, `[batch, seq, dim] -> [batch, seq, dim]`
    fn backbone(&self, input: &Tensor) -> Result<Tensor>;

    /// Codebook-0 classification head, `[.., dim] -> [.., audio_vocab]`
    fn codebook0_head(&self, hidden: &Tensor) -> Result<Tensor>;

    /// Projection from backbone width into decoder width
    fn projection(&self, input: &Tensor) -> Result<Tensor>;

    /// Decoder transform over `[batch, seq, positions, decoder_dim]`
    fn decoder(&self, input: &Tensor) -> Result<Tensor>;

    /// Classification weights `[decoder_dim, audio_vocab]` for codebook `index + 1`
    fn audio_head(&self, index: usize) -> Result<&Tensor>;

    /// Every parameter of the model
    fn parameters(&self) -> ParamTree;

    /// Parameters that are not frozen (the adapter weights when one is attached)
    fn trainable_parameters(&self) -> ParamTree;

    /// Load named weights from a safetensors file, overwriting matching parameters
    fn load_weights(&mut self, path: &Path) -> Result<()>;
}
