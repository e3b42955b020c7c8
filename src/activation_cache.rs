use crate::slice::{SliceSpec, TO_END};
use ndarray::{ArrayD, ArrayViewD, IxDyn, ShapeError, Slice};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum TensorDecodeError {
    #[error("Ragged tensor at depth {depth}: expected {expected} elements, found {found}")]
    Ragged {
        depth: usize,
        expected: usize,
        found: usize,
    },
    #[error("Expected a number at depth {depth}, found {found}")]
    NotANumber { depth: usize, found: String },
    #[error("Activation {relation_id}: {error}")]
    Activation {
        relation_id: String,
        error: Box<TensorDecodeError>,
    },
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

/// A tensor as the backend sends it: arbitrarily nested JSON lists of numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawTensor(pub Value);

impl RawTensor {
    pub fn shape(&self) -> Vec<usize> {
        let mut shape = vec![];
        let mut current = &self.0;
        while let Value::Array(items) = current {
            shape.push(items.len());
            match items.first() {
                Some(first) => current = first,
                None => break,
            }
        }
        shape
    }

    pub fn to_array(&self) -> Result<ArrayD<f32>, TensorDecodeError> {
        let shape = self.shape();
        let mut data = Vec::with_capacity(shape.iter().product());
        flatten_into(&self.0, 0, &shape, &mut data)?;
        Ok(ArrayD::from_shape_vec(IxDyn(&shape), data)?)
    }
}

impl From<Value> for RawTensor {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

fn flatten_into(
    value: &Value,
    depth: usize,
    shape: &[usize],
    out: &mut Vec<f32>,
) -> Result<(), TensorDecodeError> {
    if depth == shape.len() {
        return match value {
            Value::Number(number) => {
                let x = number.as_f64().ok_or_else(|| TensorDecodeError::NotANumber {
                    depth,
                    found: number.to_string(),
                })?;
                out.push(x as f32);
                Ok(())
            }
            other => Err(TensorDecodeError::NotANumber {
                depth,
                found: other.to_string(),
            }),
        };
    }
    match value {
        Value::Array(items) if items.len() == shape[depth] => {
            for item in items {
                flatten_into(item, depth + 1, shape, out)?;
            }
            Ok(())
        }
        Value::Array(items) => Err(TensorDecodeError::Ragged {
            depth,
            expected: shape[depth],
            found: items.len(),
        }),
        other => Err(TensorDecodeError::NotANumber {
            depth,
            found: other.to_string(),
        }),
    }
}

/// Decode every tensor of an activation payload, failing as a whole.
pub fn decode_activations(
    raw: &HashMap<String, RawTensor>,
) -> Result<HashMap<String, ArrayD<f32>>, TensorDecodeError> {
    raw.iter()
        .map(|(relation_id, tensor)| {
            tensor
                .to_array()
                .map(|array| (relation_id.clone(), array))
                .map_err(|error| TensorDecodeError::Activation {
                    relation_id: relation_id.clone(),
                    error: Box::new(error),
                })
        })
        .collect()
}

/// Activations of the most recent inference run keyed by relation id.
///
/// The whole map is swapped on every run; entries of an earlier prompt never
/// survive next to those of a later one.
#[derive(Debug, Clone, Default)]
pub struct ActivationCache {
    tensors: HashMap<String, ArrayD<f32>>,
}

impl ActivationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and install `activations`. If any tensor fails to decode the
    /// cache keeps its previous contents.
    pub fn replace(
        &mut self,
        activations: &HashMap<String, RawTensor>,
    ) -> Result<(), TensorDecodeError> {
        let decoded = decode_activations(activations)?;
        self.replace_decoded(decoded);
        Ok(())
    }

    pub fn replace_decoded(&mut self, tensors: HashMap<String, ArrayD<f32>>) {
        log::debug!("Activation cache now holds {} tensors", tensors.len());
        self.tensors = tensors;
    }

    pub fn get(&self, relation_id: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(relation_id)
    }

    /// View of the region `slice` selects, or `None` if the relation is absent
    /// or the slice does not fit the tensor.
    pub fn get_slice(&self, relation_id: &str, slice: &SliceSpec) -> Option<ArrayViewD<'_, f32>> {
        let tensor = self.tensors.get(relation_id)?;
        if slice.rank() != tensor.ndim() {
            return None;
        }
        let mut bounds = Vec::with_capacity(slice.rank());
        for (range, len) in slice.ranges().iter().zip(tensor.shape()) {
            let len = *len as i64;
            let end = if range.end == TO_END { len } else { range.end };
            if range.start < 0 || range.start > end || end > len {
                return None;
            }
            bounds.push((range.start as isize, end as isize));
        }
        Some(tensor.slice_each_axis(|axis| {
            let (start, end) = bounds[axis.axis.index()];
            Slice::new(start, Some(end), 1)
        }))
    }

    pub fn contains(&self, relation_id: &str) -> bool {
        self.tensors.contains_key(relation_id)
    }

    pub fn relation_ids(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn clear(&mut self) {
        self.tensors.clear();
    }
}
