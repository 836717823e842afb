//! [`NativeBackend`] over llama.cpp.

use std::{num::NonZeroU32, sync::OnceLock};

use llama_cpp_2::{
    context::{params::LlamaContextParams, LlamaContext},
    llama_backend::LlamaBackend,
    llama_batch::LlamaBatch,
    model::{params::LlamaModelParams, AddBos, LlamaModel, Special},
    token::LlamaToken,
};
use llamabot_core::{
    backend::{BackendSettings, CacheType, DecodeItem, NativeBackend, ALL_SEQUENCES},
    token::{SeqId, TokenId},
    Error, Result,
};

/// The library can be initialized once per process.
static BACKEND: OnceLock<std::result::Result<LlamaBackend, String>> = OnceLock::new();

fn backend() -> Result<&'static LlamaBackend> {
    let result = BACKEND.get_or_init(|| {
        let mut backend = LlamaBackend::init().map_err(|err| err.to_string())?;
        backend.void_logs();
        Ok(backend)
    });
    result.as_ref().map_err(|err| Error::Backend(err.clone()))
}

fn native(err: impl std::fmt::Display) -> Error {
    Error::Backend(err.to_string())
}

pub struct LlamaCppBackend {
    model: &'static LlamaModel,
    context: LlamaContext<'static>,
    logits: Option<Vec<f32>>,
}

impl LlamaCppBackend {
    /// Loads the model and creates its context. The model stays loaded for the
    /// rest of the process.
    pub fn load(settings: &BackendSettings) -> Result<Self> {
        settings.validate()?;
        let backend = backend()?;

        let params = LlamaModelParams::default().with_n_gpu_layers(settings.gpu_layers);
        let model =
            LlamaModel::load_from_file(backend, &settings.model_path, &params).map_err(native)?;
        let model: &'static LlamaModel = Box::leak(Box::new(model));

        let n_ctx = NonZeroU32::new(settings.context_length as u32);
        let mut params = LlamaContextParams::default()
            .with_n_ctx(n_ctx)
            .with_n_batch(settings.batch_size as u32);
        if settings.flash_attention
            || settings.type_k != CacheType::F16
            || settings.type_v != CacheType::F16
        {
            log::warn!("[llama] cache type and flash attention are left to the library defaults");
        }
        if let Some(threads) = settings.threads {
            params = params
                .with_n_threads(threads as i32)
                .with_n_threads_batch(threads as i32);
        }
        if let Some(base) = settings.rope_freq_base {
            params = params.with_rope_freq_base(base);
        }
        if let Some(scale) = settings.rope_freq_scale {
            params = params.with_rope_freq_scale(scale);
        }
        let context = model.new_context(backend, params).map_err(native)?;

        log::info!(
            "[llama] loaded {} with {} cells",
            settings.model_path.display(),
            context.n_ctx()
        );
        Ok(Self {
            model,
            context,
            logits: None,
        })
    }
}

fn sequence(seq: SeqId) -> Option<u32> {
    match seq {
        ALL_SEQUENCES => None,
        seq => Some(seq as u32),
    }
}

impl NativeBackend for LlamaCppBackend {
    fn n_vocab(&self) -> usize {
        self.model.n_vocab() as usize
    }

    fn n_ctx(&self) -> usize {
        self.context.n_ctx() as usize
    }

    fn n_batch(&self) -> usize {
        self.context.n_batch() as usize
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>> {
        let add_bos = match add_bos {
            true => AddBos::Always,
            false => AddBos::Never,
        };
        let tokens = self.model.str_to_token(text, add_bos).map_err(native)?;
        Ok(tokens.into_iter().map(|x| x.0).collect())
    }

    fn token_to_piece(&self, token: TokenId) -> Result<String> {
        #[allow(deprecated)]
        self.model
            .token_to_str(LlamaToken(token), Special::Tokenize)
            .map_err(native)
    }

    fn decode(&mut self, batch: &[DecodeItem]) -> Result<()> {
        let mut native_batch = LlamaBatch::new(batch.len().max(1), 1);
        for item in batch {
            native_batch
                .add(
                    LlamaToken(item.token),
                    item.position as i32,
                    &item.seq_ids,
                    item.logits,
                )
                .map_err(native)?;
        }
        self.context.decode(&mut native_batch).map_err(native)?;
        if let Some(index) = batch.iter().rposition(|x| x.logits) {
            self.logits = Some(self.context.get_logits_ith(index as i32).to_vec());
        }
        Ok(())
    }

    fn logits(&self) -> Result<&[f32]> {
        self.logits
            .as_deref()
            .ok_or_else(|| Error::Backend("no logits decoded yet".into()))
    }

    fn remove_cache_tokens(&mut self, seq: SeqId, start: usize, end: usize) -> Result<()> {
        self.context
            .clear_kv_cache_seq(sequence(seq), Some(start as u32), Some(end as u32))
            .map_err(native)?;
        Ok(())
    }

    fn shift_cache_tokens(
        &mut self,
        seq: SeqId,
        start: usize,
        end: usize,
        delta: isize,
    ) -> Result<()> {
        self.context
            .kv_cache_seq_add(seq, Some(start as u32), Some(end as u32), delta as i32)
            .map_err(native)
    }

    fn clear_cache(&mut self) -> Result<()> {
        self.context.clear_kv_cache();
        self.logits = None;
        Ok(())
    }
}
