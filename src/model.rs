// TransDG: knowledge-grounded response generation.
//
//   posts ──embed──> StackedRnn ──> outputs ──+── mutual context (exemplar tokens)
//                                             +── trans reprs (optional)
//   triples ──embed──> TransferMatching(outputs) ──> kd_context (optional)
//   decoder: Bahdanau attention over outputs (+ kd_context), teacher-forced or greedy
//
// Every trainable weight lives in one VarMap. The word embedding and, unless
// `train_select_layer` is set, the selector weights stay outside it.

use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info, warn};

use crate::attention::AttentionMemory;
use crate::batch::{Batch, BatchIds};
use crate::config::ModelConfig;
use crate::decoder::Decoder;
use crate::embedding::WordEmbedding;
use crate::encoder::Encoder;
use crate::error::ModelError;
use crate::loss::{sentence_ppx, sequence_loss, sequence_mask};
use crate::rnn::RnnState;
use crate::selector::{KnowledgeSelector, SelectMode, SelectorParams, TransferMatching};
use crate::training::{Trainer, TrainingConfig};
use crate::vocab::{Vocabularies, EOS_ID};

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BatchLoss {
    /// Per-sentence perplexity.
    pub ppx: Vec<f32>,
    /// Mean masked cross-entropy.
    pub loss: f32,
}

#[derive(Debug, Clone)]
pub struct Decoded {
    /// Greedy generation per example, cut before EOS.
    pub generation: Vec<Vec<String>>,
    pub ppx: Vec<f32>,
    pub loss: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamInfo {
    pub name: String,
    pub shape: Vec<usize>,
}

struct Encoded {
    memory: AttentionMemory,
    state: RnnState,
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

pub struct TransDgModel {
    config: ModelConfig,
    device: Device,
    varmap: VarMap,
    embed: WordEmbedding,
    vocabs: Option<Vocabularies>,
    encoder: Encoder,
    matcher: Option<TransferMatching>,
    decoder: Decoder,
    trainer: Trainer,
}

impl TransDgModel {
    /// `word_embed` is (vocab_size, dim_emb). `select_params` is only read when
    /// `use_trans_select` is set; its keys decide the selector mode.
    pub fn new(
        config: ModelConfig,
        word_embed: Tensor,
        select_params: &SelectorParams,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let embed = WordEmbedding::new(
            word_embed.to_device(device)?.to_dtype(DType::F32)?,
            config.vocab_size,
            config.dim_emb,
        )?;
        let encoder = Encoder::new(&config, vb.clone())?;

        let matcher = if config.use_trans_select {
            let params: SelectorParams = select_params
                .iter()
                .map(|(k, v)| -> Result<(String, Tensor)> {
                    Ok((k.clone(), v.to_device(device)?.to_dtype(DType::F32)?))
                })
                .collect::<Result<_>>()?;
            let selector = KnowledgeSelector::from_params(
                &params,
                config.num_units,
                config.dim_emb,
                config.train_select_layer,
                &varmap,
            )?;
            info!(mode = %selector.mode(), trainable = config.train_select_layer, "knowledge selector");
            Some(TransferMatching::new(
                selector,
                config.num_units,
                config.dim_emb,
                vb.pp("decoder").pp("transfer"),
            )?)
        } else {
            if !select_params.is_empty() {
                debug!("use_trans_select is off, ignoring {} selector params", select_params.len());
            }
            None
        };

        let decoder = Decoder::new(
            &config,
            matcher.as_ref().map(|m| m.output_dim()),
            vb.pp("decoder"),
        )?;

        if config.drop_rate > 0.0 {
            warn!(drop_rate = config.drop_rate, "drop_rate is accepted but not applied");
        }
        if config.beam_size > 1 {
            warn!(beam_size = config.beam_size, "beam search not implemented, decoding greedily");
        }

        // Parameter set is fixed here; nothing registers vars after this point.
        let trainer = Trainer::new(
            varmap.all_vars(),
            TrainingConfig {
                lr: config.lr_rate,
                max_grad_norm: config.max_grad_norm,
            },
        )?;
        info!(
            cell = ?config.cell_class,
            num_units = config.num_units,
            num_layers = config.num_layers,
            vars = trainer.num_vars(),
            "model built"
        );

        Ok(Self {
            config,
            device: device.clone(),
            varmap,
            embed,
            vocabs: None,
            encoder,
            matcher,
            decoder,
            trainer,
        })
    }

    // --- Vocabulary ---

    /// Populate the word and knowledge-type tables by list position.
    /// A second call replaces both tables.
    pub fn set_vocabs(&mut self, words: &[String], kd_types: &[String]) -> Result<()> {
        if words.len() != self.config.vocab_size {
            return Err(ModelError::VocabularySize {
                expected: self.config.vocab_size,
                got: words.len(),
            }
            .into());
        }
        if self.vocabs.is_some() {
            warn!("set_vocabs called again, replacing existing tables");
        }
        self.vocabs = Some(Vocabularies::new(words, kd_types));
        info!(words = words.len(), kd_types = kd_types.len(), "vocabularies set");
        Ok(())
    }

    pub fn vocabs(&self) -> Result<&Vocabularies> {
        self.vocabs.as_ref().ok_or_else(|| ModelError::VocabularyNotSet.into())
    }

    pub fn lookup_word(&self, word: &str) -> Result<u32> {
        Ok(self.vocabs()?.words.id(word))
    }

    pub fn lookup_word_id(&self, id: u32) -> Result<&str> {
        Ok(self.vocabs()?.words.symbol(id))
    }

    pub fn lookup_kd(&self, kd_type: &str) -> Result<u32> {
        Ok(self.vocabs()?.kd.id(kd_type))
    }

    pub fn lookup_kd_id(&self, id: u32) -> Result<&str> {
        Ok(self.vocabs()?.kd.symbol(id))
    }

    // --- Introspection ---

    /// Fixed at construction; the built sub-modules depend on it.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// The frozen word embedding matrix (vocab_size, dim_emb).
    pub fn word_embedding(&self) -> &Tensor {
        self.embed.matrix()
    }

    pub fn select_mode(&self) -> Option<SelectMode> {
        self.matcher.as_ref().map(|m| m.mode())
    }

    pub fn global_step(&self) -> usize {
        self.trainer.step_count()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Name and shape of every trainable parameter, sorted by name.
    pub fn show_parameters(&self) -> Result<Vec<ParamInfo>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| anyhow!("parameter map poisoned: {e}"))?;
        let mut params: Vec<ParamInfo> = data
            .iter()
            .map(|(name, var)| ParamInfo {
                name: name.clone(),
                shape: var.as_tensor().dims().to_vec(),
            })
            .collect();
        params.sort_by(|a, b| a.name.cmp(&b.name));
        for p in &params {
            info!("{}: {:?}", p.name, p.shape);
        }
        Ok(params)
    }

    pub fn num_parameters(&self) -> Result<usize> {
        Ok(self
            .show_parameters()?
            .iter()
            .map(|p| p.shape.iter().product::<usize>())
            .sum())
    }

    // --- Graph ---

    fn tensorize(&self, batch: &Batch) -> Result<BatchIds> {
        batch.to_ids(&self.vocabs()?.words, &self.device)
    }

    fn encode(&self, ids: &BatchIds, trans_reprs: Option<&Tensor>) -> Result<Encoded> {
        let trans_reprs = match (self.config.use_trans_repr, trans_reprs) {
            (true, None) => return Err(ModelError::MissingTransReprs.into()),
            (true, Some(t)) => Some(t.to_device(&self.device)?.to_dtype(DType::F32)?),
            (false, _) => None,
        };

        let post_emb = self.embed.embed(&ids.posts)?;
        let corr_emb = self.embed.embed(&ids.corr_responses)?;
        let encoded = self
            .encoder
            .forward(&post_emb, &ids.post_len, &corr_emb, trans_reprs.as_ref())?;

        let kd_context = match &self.matcher {
            Some(m) => {
                let knowledge = self.embed.embed_triples(&ids.triples)?;
                Some(m.forward(&encoded.outputs, &knowledge)?)
            }
            None => None,
        };
        let memory = self.decoder.prepare(&encoded.outputs, kd_context.as_ref())?;
        Ok(Encoded {
            memory,
            state: encoded.state,
        })
    }

    /// Teacher-forced (per-sentence ppx, sequence loss).
    fn losses(&self, ids: &BatchIds, encoded: &Encoded) -> Result<(Tensor, Tensor)> {
        let inputs = self.embed.embed(&ids.decoder_inputs)?;
        let logits = self
            .decoder
            .train(&encoded.memory, encoded.state.clone(), &inputs)?;
        let len = ids.responses.dim(1)?;
        let mask = sequence_mask(&ids.response_len, len, &self.device)?;
        let ppx = sentence_ppx(&logits, &ids.responses, &mask)?;
        let loss = sequence_loss(&logits, &ids.responses, &mask)?;
        Ok((ppx, loss))
    }

    // --- Batch entry points ---

    /// One optimizer step on `batch`. Returns the losses measured before the update.
    pub fn train_batch(&mut self, batch: &Batch, trans_reprs: Option<&Tensor>) -> Result<BatchLoss> {
        let ids = self.tensorize(batch)?;
        let encoded = self.encode(&ids, trans_reprs)?;
        let (ppx, loss) = self.losses(&ids, &encoded)?;
        let out = BatchLoss {
            ppx: ppx.to_vec1::<f32>()?,
            loss: loss.to_scalar::<f32>()?,
        };
        let step = self.trainer.backward_step(&loss)?;
        debug!(step, loss = out.loss, "train batch");
        Ok(out)
    }

    pub fn eval_batch(&self, batch: &Batch, trans_reprs: Option<&Tensor>) -> Result<BatchLoss> {
        let ids = self.tensorize(batch)?;
        let encoded = self.encode(&ids, trans_reprs)?;
        let (ppx, loss) = self.losses(&ids, &encoded)?;
        Ok(BatchLoss {
            ppx: ppx.to_vec1::<f32>()?,
            loss: loss.to_scalar::<f32>()?,
        })
    }

    /// Greedy generation plus the teacher-forced losses on the same batch.
    pub fn decode_batch(&self, batch: &Batch, trans_reprs: Option<&Tensor>) -> Result<Decoded> {
        let vocabs = self.vocabs()?;
        let ids = self.tensorize(batch)?;
        let encoded = self.encode(&ids, trans_reprs)?;
        let (ppx, loss) = self.losses(&ids, &encoded)?;
        let generated = self
            .decoder
            .infer(&encoded.memory, encoded.state.clone(), &self.embed)?;

        let generation = generated
            .iter()
            .map(|row| {
                row.iter()
                    .take_while(|&&id| id != EOS_ID)
                    .map(|&id| vocabs.words.symbol(id).to_string())
                    .collect()
            })
            .collect();

        Ok(Decoded {
            generation,
            ppx: ppx.to_vec1::<f32>()?,
            loss: loss.to_scalar::<f32>()?,
        })
    }
}
