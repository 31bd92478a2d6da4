//! Documents and the corpus provider interface.
//!
//! Loading and tokenization live outside the engine; the engine only
//! sees bags of `(word id, count)` pairs and a parallel label sequence.

use crate::error::MedLdaError;

/// A bag of words: `(word id, count)` pairs in document order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Document {
    /// `(word id, count)` pairs
    pub words: Vec<(usize, u32)>,
}

impl Document {
    /// Build from `(word id, count)` pairs.
    pub fn new(words: Vec<(usize, u32)>) -> Self {
        Document { words }
    }

    /// Number of token instances.
    pub fn len(&self) -> usize {
        self.words.iter().map(|&(_, c)| c as usize).sum()
    }

    /// True if the document has no tokens.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Word id of every token instance, expanded from the counts.
    pub fn tokens(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .flat_map(|&(w, c)| std::iter::repeat(w).take(c as usize))
    }
}

/// Source of labeled mini-batches.
pub trait CorpusProvider {
    /// Total number of training documents.
    fn num_docs(&self) -> usize;

    /// Vocabulary size T.
    fn vocab_size(&self) -> usize;

    /// Documents `start..start + size` (clipped to the corpus) and their labels.
    fn batch(&self, start: usize, size: usize) -> anyhow::Result<(Vec<Document>, Vec<i32>)>;
}

/// Corpus held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCorpus {
    /// Documents
    pub docs: Vec<Document>,
    /// One label per document
    pub labels: Vec<i32>,
    /// Vocabulary size
    pub vocab_size: usize,
}

impl InMemoryCorpus {
    /// Build a corpus; fails on a label/document count mismatch.
    pub fn new(docs: Vec<Document>, labels: Vec<i32>, vocab_size: usize) -> anyhow::Result<Self> {
        if docs.len() != labels.len() {
            return Err(MedLdaError::data(format!(
                "{} documents but {} labels",
                docs.len(),
                labels.len()
            )));
        }
        Ok(InMemoryCorpus {
            docs,
            labels,
            vocab_size,
        })
    }
}

impl CorpusProvider for InMemoryCorpus {
    fn num_docs(&self) -> usize {
        self.docs.len()
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn batch(&self, start: usize, size: usize) -> anyhow::Result<(Vec<Document>, Vec<i32>)> {
        let lb = start.min(self.docs.len());
        let ub = start.saturating_add(size).min(self.docs.len());
        Ok((self.docs[lb..ub].to_vec(), self.labels[lb..ub].to_vec()))
    }
}

/// Classifier response `y ∈ {-1, +1}` for a label.
///
/// Without a category the label itself must be ±1; with one, the label
/// is a category index and `y = +1` exactly for that category.
pub fn response(label: i32, category: Option<usize>) -> anyhow::Result<f64> {
    match category {
        None => match label {
            1 => Ok(1.0),
            -1 => Ok(-1.0),
            _ => Err(MedLdaError::data(format!(
                "binary label must be +1 or -1, got {}",
                label
            ))),
        },
        Some(cat) => {
            if label < 0 {
                return Err(MedLdaError::data(format!(
                    "category label must be a non-negative index, got {}",
                    label
                )));
            }
            Ok(if label as usize == cat { 1.0 } else { -1.0 })
        }
    }
}

/// Check a batch against the model before anything is mutated.
///
/// Returns the responses `y_d`.
pub fn validate_batch(
    docs: &[Document],
    labels: &[i32],
    vocab_size: usize,
    category: Option<usize>,
) -> anyhow::Result<Vec<f64>> {
    if docs.len() != labels.len() {
        return Err(MedLdaError::data(format!(
            "{} documents but {} labels",
            docs.len(),
            labels.len()
        )));
    }
    if docs.is_empty() {
        return Err(MedLdaError::data("empty batch"));
    }
    for (d, doc) in docs.iter().enumerate() {
        if doc.is_empty() {
            return Err(MedLdaError::data(format!("document {} has no tokens", d)));
        }
        if let Some(&(w, _)) = doc.words.iter().find(|&&(w, _)| w >= vocab_size) {
            return Err(MedLdaError::data(format!(
                "document {} has word id {} outside vocabulary of {}",
                d, w, vocab_size
            )));
        }
    }
    labels.iter().map(|&l| response(l, category)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;

    #[test]
    fn test_tokens_expand_counts() {
        let doc = Document::new(vec![(0, 3), (2, 1)]);
        assert_eq!(doc.len(), 4);
        assert_eq!(doc.tokens().collect::<Vec<_>>(), vec![0, 0, 0, 2]);
    }

    #[test]
    fn test_response() {
        assert_eq!(response(1, None).unwrap(), 1.0);
        assert_eq!(response(-1, None).unwrap(), -1.0);
        assert!(response(0, None).is_err());
        assert_eq!(response(3, Some(3)).unwrap(), 1.0);
        assert_eq!(response(2, Some(3)).unwrap(), -1.0);
        assert!(response(-1, Some(3)).is_err());
    }

    #[test]
    fn test_validate_batch_rejects_bad_input() {
        let docs = vec![Document::new(vec![(0, 1)]), Document::new(vec![(5, 1)])];
        let err = validate_batch(&docs, &[1], 4, None).unwrap_err();
        assert!(matches!(kind_of(&err), Some(MedLdaError::Data { .. })));

        let err = validate_batch(&docs, &[1, -1], 4, None).unwrap_err();
        assert!(err.to_string().contains("word id 5"));

        let ok = validate_batch(&docs, &[1, -1], 6, None).unwrap();
        assert_eq!(ok, vec![1.0, -1.0]);

        let empty = vec![Document::default()];
        assert!(validate_batch(&empty, &[1], 6, None).is_err());
    }

    #[test]
    fn test_in_memory_batches_clip() {
        let docs = (0..5).map(|w| Document::new(vec![(w, 1)])).collect();
        let corpus = InMemoryCorpus::new(docs, vec![1, -1, 1, -1, 1], 5).unwrap();
        let (b, l) = corpus.batch(3, 4).unwrap();
        assert_eq!(b.len(), 2);
        assert_eq!(l, vec![-1, 1]);
        let (b, _) = corpus.batch(10, 4).unwrap();
        assert!(b.is_empty());
    }
}
