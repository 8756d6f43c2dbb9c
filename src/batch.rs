// Batch contract: aligned, already-padded token sequences. Loading and bucketing
// live outside this crate; `Batch::from_examples` only pads in memory.

use anyhow::Result;
use candle_core::{Device, Tensor};

use crate::error::ModelError;
use crate::vocab::{SymbolTable, EOS_SYMBOL, GO_ID, PAD_SYMBOL};

/// One raw dialogue example.
#[derive(Clone, Debug, Default)]
pub struct Example {
    pub post: Vec<String>,
    pub response: Vec<String>,
    pub corr_responses: Vec<Vec<String>>,
    pub triples: Vec<[String; 3]>,
}

/// A batch of padded string sequences.
/// Shapes: posts (b, post_len), responses (b, resp_len),
/// corr_responses (b, topk, len), triples (b, n, 3).
#[derive(Clone, Debug, Default)]
pub struct Batch {
    pub posts: Vec<Vec<String>>,
    pub post_len: Vec<usize>,
    pub responses: Vec<Vec<String>>,
    pub response_len: Vec<usize>,
    pub corr_responses: Vec<Vec<Vec<String>>>,
    pub triples: Vec<Vec<[String; 3]>>,
}

/// Token ids for one batch, on the model's device.
pub struct BatchIds {
    pub posts: Tensor,
    pub post_len: Vec<usize>,
    /// Decoder targets (b, resp_len).
    pub responses: Tensor,
    pub response_len: Vec<usize>,
    /// GO followed by the targets shifted right by one.
    pub decoder_inputs: Tensor,
    pub corr_responses: Tensor,
    pub triples: Tensor,
}

fn pad_to(seq: &[String], len: usize) -> Vec<String> {
    let mut out = seq.to_vec();
    out.resize(len, PAD_SYMBOL.to_string());
    out
}

/// Common row width; errors on ragged rows.
fn width<T>(what: &'static str, rows: &[Vec<T>]) -> Result<usize, ModelError> {
    let w = rows.first().map(|r| r.len()).unwrap_or(0);
    if let Some(bad) = rows.iter().find(|r| r.len() != w) {
        return Err(ModelError::shape(what, &[rows.len(), w], &[rows.len(), bad.len()]));
    }
    Ok(w)
}

impl Batch {
    /// Pad examples into a batch. Responses get a trailing EOS, which counts
    /// toward `response_len`.
    pub fn from_examples(examples: &[Example]) -> Self {
        let post_w = examples.iter().map(|e| e.post.len()).max().unwrap_or(0).max(1);
        let resp_w = examples.iter().map(|e| e.response.len() + 1).max().unwrap_or(1);
        let topk = examples.iter().map(|e| e.corr_responses.len()).max().unwrap_or(0).max(1);
        let corr_w = examples
            .iter()
            .flat_map(|e| e.corr_responses.iter().map(|c| c.len()))
            .max()
            .unwrap_or(0)
            .max(1);
        let n_triples = examples.iter().map(|e| e.triples.len()).max().unwrap_or(0).max(1);
        let pad_triple = || [PAD_SYMBOL.to_string(), PAD_SYMBOL.to_string(), PAD_SYMBOL.to_string()];

        let mut batch = Batch::default();
        for ex in examples {
            batch.posts.push(pad_to(&ex.post, post_w));
            batch.post_len.push(ex.post.len());

            let mut resp = ex.response.clone();
            resp.push(EOS_SYMBOL.to_string());
            batch.response_len.push(resp.len());
            batch.responses.push(pad_to(&resp, resp_w));

            let mut corr: Vec<Vec<String>> =
                ex.corr_responses.iter().map(|c| pad_to(c, corr_w)).collect();
            corr.resize(topk, vec![PAD_SYMBOL.to_string(); corr_w]);
            batch.corr_responses.push(corr);

            let mut triples = ex.triples.clone();
            triples.resize(n_triples, pad_triple());
            batch.triples.push(triples);
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    /// Check that every field is rectangular, aligned on the batch axis, and that
    /// declared lengths fit inside the padded widths.
    pub fn validate(&self) -> Result<(), ModelError> {
        let b = self.posts.len();
        if b == 0 {
            return Err(ModelError::shape("posts", &[1, 1], &[0, 0]));
        }
        let aligned = [
            ("post_len", self.post_len.len()),
            ("responses", self.responses.len()),
            ("response_len", self.response_len.len()),
            ("corr_responses", self.corr_responses.len()),
            ("triples", self.triples.len()),
        ];
        for (what, n) in aligned {
            if n != b {
                return Err(ModelError::shape(what, &[b], &[n]));
            }
        }

        let post_w = width("posts", &self.posts)?;
        let resp_w = width("responses", &self.responses)?;
        if post_w == 0 || resp_w == 0 {
            return Err(ModelError::shape("posts/responses", &[b, 1], &[b, post_w.min(resp_w)]));
        }
        if let Some(&l) = self.post_len.iter().find(|&&l| l > post_w) {
            return Err(ModelError::shape("post_len", &[post_w], &[l]));
        }
        if let Some(&l) = self.response_len.iter().find(|&&l| l > resp_w) {
            return Err(ModelError::shape("response_len", &[resp_w], &[l]));
        }

        let topk = width("corr_responses", &self.corr_responses)?;
        let rows: Vec<Vec<String>> = self.corr_responses.iter().flatten().cloned().collect();
        let corr_w = width("corr_responses", &rows)?;
        if topk == 0 || corr_w == 0 {
            return Err(ModelError::shape("corr_responses", &[b, 1, 1], &[b, topk, corr_w]));
        }

        let n = width("triples", &self.triples)?;
        if n == 0 {
            return Err(ModelError::shape("triples", &[b, 1, 3], &[b, 0, 3]));
        }
        Ok(())
    }

    /// Map every token through `words` and build id tensors.
    pub fn to_ids(&self, words: &SymbolTable, device: &Device) -> Result<BatchIds> {
        self.validate()?;
        let b = self.len();
        let post_w = self.posts[0].len();
        let resp_w = self.responses[0].len();
        let topk = self.corr_responses[0].len();
        let corr_w = self.corr_responses[0][0].len();
        let n = self.triples[0].len();

        let posts: Vec<u32> = self.posts.iter().flat_map(|r| words.ids(r)).collect();
        let targets: Vec<Vec<u32>> = self.responses.iter().map(|r| words.ids(r)).collect();
        let decoder_inputs: Vec<u32> = targets
            .iter()
            .flat_map(|r| std::iter::once(GO_ID).chain(r[..resp_w - 1].iter().copied()))
            .collect();
        let corr: Vec<u32> = self
            .corr_responses
            .iter()
            .flatten()
            .flat_map(|r| words.ids(r))
            .collect();
        let triples: Vec<u32> = self
            .triples
            .iter()
            .flatten()
            .flat_map(|t| words.ids(t))
            .collect();

        Ok(BatchIds {
            posts: Tensor::from_vec(posts, (b, post_w), device)?,
            post_len: self.post_len.clone(),
            responses: Tensor::from_vec(targets.concat(), (b, resp_w), device)?,
            response_len: self.response_len.clone(),
            decoder_inputs: Tensor::from_vec(decoder_inputs, (b, resp_w), device)?,
            corr_responses: Tensor::from_vec(corr, (b, topk, corr_w), device)?,
            triples: Tensor::from_vec(triples, (b, n, 3), device)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::{with_reserved_symbols, EOS_ID, UNK_ID};

    fn s(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn triple(a: &str, r: &str, b: &str) -> [String; 3] {
        [a.into(), r.into(), b.into()]
    }

    fn examples() -> Vec<Example> {
        vec![
            Example {
                post: s(&["is", "it", "raining"]),
                response: s(&["take", "an", "umbrella"]),
                corr_responses: vec![s(&["yes"]), s(&["bring", "a", "coat"])],
                triples: vec![triple("rain", "RelatedTo", "umbrella")],
            },
            Example {
                post: s(&["hi"]),
                response: s(&["hello"]),
                corr_responses: vec![s(&["hey"])],
                triples: vec![
                    triple("hi", "Synonym", "hello"),
                    triple("hello", "IsA", "greeting"),
                ],
            },
        ]
    }

    #[test]
    fn test_from_examples_pads_everything() -> Result<()> {
        let batch = Batch::from_examples(&examples());
        batch.validate()?;
        assert_eq!(batch.post_len, vec![3, 1]);
        assert_eq!(batch.response_len, vec![4, 2]);
        assert_eq!(batch.responses[1], s(&["hello", EOS_SYMBOL, PAD_SYMBOL, PAD_SYMBOL]));
        assert_eq!(batch.corr_responses[1].len(), 2);
        assert_eq!(batch.corr_responses[0][0].len(), 3);
        assert_eq!(batch.triples[0].len(), 2);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_ragged_and_overlong() {
        let mut batch = Batch::from_examples(&examples());
        batch.posts[1].pop();
        assert!(batch.validate().is_err());

        let mut batch = Batch::from_examples(&examples());
        batch.response_len[0] = 99;
        assert!(batch.validate().is_err());

        let mut batch = Batch::from_examples(&examples());
        batch.triples.pop();
        assert!(batch.validate().is_err());
    }

    #[test]
    fn test_to_ids_shapes_and_shift() -> Result<()> {
        let vocab = with_reserved_symbols(&["hello", "hi", "take", "an", "umbrella"]);
        let words = SymbolTable::new(&vocab, UNK_ID, "_UNK");
        let batch = Batch::from_examples(&examples());
        let ids = batch.to_ids(&words, &Device::Cpu)?;

        assert_eq!(ids.posts.dims(), &[2, 3]);
        assert_eq!(ids.corr_responses.dims(), &[2, 2, 3]);
        assert_eq!(ids.triples.dims(), &[2, 2, 3]);

        let targets = ids.responses.to_vec2::<u32>()?;
        let inputs = ids.decoder_inputs.to_vec2::<u32>()?;
        assert_eq!(targets[0], vec![6, 7, 8, EOS_ID]);
        assert_eq!(inputs[0], vec![GO_ID, 6, 7, 8]);
        assert_eq!(ids.posts.to_vec2::<u32>()?[0], vec![UNK_ID; 3]);
        Ok(())
    }
}
