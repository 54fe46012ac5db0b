//! Named `f32` tensors exchanged between collaborators and the checkpoint store.
//!
//! A `Snapshot` is what `state_dict` returns and `load_state_dict` consumes. Whoever owns
//! it decides the tensor names; the store only prefixes and persists them.

use std::collections::{BTreeMap, HashMap};

use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::{MlErr, Result};

/// A dense `f32` tensor with its shape.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorBlob {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// An ordered collection of named tensors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    tensors: BTreeMap<String, TensorBlob>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tensor, replacing any previous one with the same name.
    ///
    /// # Errors
    /// Returns `MlErr::SizeMismatch` if `data` doesn't hold exactly `shape.product()` values.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        shape: Vec<usize>,
        data: Vec<f32>,
    ) -> Result<()> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(MlErr::SizeMismatch {
                what: "snapshot tensor",
                got: data.len(),
                expected,
            });
        }

        self.tensors.insert(name.into(), TensorBlob { shape, data });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TensorBlob> {
        self.tensors.get(name)
    }

    /// Looks up `name` and checks it has the given shape.
    pub fn expect(&self, name: &str, shape: &[usize]) -> Result<&TensorBlob> {
        let blob = self
            .get(name)
            .ok_or_else(|| MlErr::MissingTensor(name.to_string()))?;

        if blob.shape != shape {
            return Err(MlErr::ShapeMismatch {
                name: name.to_string(),
                got: blob.shape.clone(),
                expected: shape.to_vec(),
            });
        }

        Ok(blob)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Returns a copy with every name prefixed by `prefix`.
    pub fn prefixed(&self, prefix: &str) -> Snapshot {
        let tensors = self
            .tensors
            .iter()
            .map(|(name, blob)| (format!("{prefix}{name}"), blob.clone()))
            .collect();

        Snapshot { tensors }
    }

    /// Returns the tensors whose name starts with `prefix`, with the prefix removed.
    pub fn strip_prefix(&self, prefix: &str) -> Snapshot {
        let tensors = self
            .tensors
            .iter()
            .filter_map(|(name, blob)| {
                name.strip_prefix(prefix)
                    .map(|rest| (rest.to_string(), blob.clone()))
            })
            .collect();

        Snapshot { tensors }
    }

    /// Moves every tensor of `other` into `self`.
    pub fn merge(&mut self, other: Snapshot) {
        self.tensors.extend(other.tensors);
    }

    /// Encodes the snapshot and its string metadata as a safetensors buffer.
    pub fn to_bytes(&self, metadata: HashMap<String, String>) -> Result<Vec<u8>> {
        let views = self
            .tensors
            .iter()
            .map(|(name, blob)| {
                let bytes: &[u8] = bytemuck::cast_slice(&blob.data);
                TensorView::new(Dtype::F32, blob.shape.clone(), bytes).map(|view| (name, view))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let views = views.iter().map(|(name, view)| (*name, view));
        Ok(safetensors::serialize(views, &Some(metadata))?)
    }

    /// Decodes a safetensors buffer produced by `to_bytes`.
    ///
    /// # Errors
    /// Returns `MlErr::Format` if the buffer is malformed or holds a non `f32` tensor.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Snapshot, HashMap<String, String>)> {
        let (_, header) = SafeTensors::read_metadata(bytes)?;
        let metadata = header.metadata().clone().unwrap_or_default();

        let tensors = SafeTensors::deserialize(bytes)?;
        let mut snapshot = Snapshot::new();

        for (name, view) in tensors.tensors() {
            if view.dtype() != Dtype::F32 {
                return Err(MlErr::Format(format!(
                    "tensor {name} has dtype {:?}, expected F32",
                    view.dtype()
                )));
            }

            // The view may be unaligned inside the file buffer.
            let data = view
                .data()
                .chunks_exact(size_of::<f32>())
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            snapshot.insert(name, view.shape().to_vec(), data)?;
        }

        Ok((snapshot, metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        let mut snapshot = Snapshot::new();
        snapshot.insert("w", vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        snapshot.insert("b", vec![2], vec![0.5, -0.5]).unwrap();
        snapshot
    }

    #[test]
    fn insert_checks_element_count() {
        let mut snapshot = Snapshot::new();
        assert!(snapshot.insert("w", vec![2, 3], vec![0.0; 5]).is_err());
    }

    #[test]
    fn prefixes_separate_owners() {
        let mut all = sample().prefixed("model.");
        all.merge(sample().prefixed("optimizer."));

        assert_eq!(all.len(), 4);
        assert_eq!(all.strip_prefix("model."), sample());
    }

    #[test]
    fn bytes_keep_tensors_and_metadata() {
        let metadata = HashMap::from([("iteration".to_string(), "7".to_string())]);
        let bytes = sample().to_bytes(metadata.clone()).unwrap();

        let (snapshot, got) = Snapshot::from_bytes(&bytes).unwrap();
        assert_eq!(snapshot, sample());
        assert_eq!(got, metadata);
    }

    #[test]
    fn garbage_is_a_format_error() {
        let err = Snapshot::from_bytes(b"definitely not safetensors").unwrap_err();
        assert!(matches!(err, MlErr::Format(_)));
    }

    #[test]
    fn expect_reports_shape() {
        let snapshot = sample();
        assert!(snapshot.expect("w", &[2, 2]).is_ok());
        assert!(matches!(
            snapshot.expect("w", &[4]),
            Err(MlErr::ShapeMismatch { .. })
        ));
        assert!(matches!(
            snapshot.expect("nope", &[1]),
            Err(MlErr::MissingTensor(_))
        ));
    }
}
