//! Tensor implementation
//!
//! Provides the core `Tensor` type: an N-dimensional array in row-major
//! layout with validated construction. All pipeline values (token ids,
//! hidden states, masks, cache entries) flow through this type.

use std::fmt;

use num_traits::Num;
use serde::{Deserialize, Serialize};

use crate::error::{PortarError, Result};

/// N-dimensional tensor in row-major order
///
/// # Examples
///
/// ```
/// use portar::Tensor;
///
/// let t = Tensor::from_vec(vec![2, 3], vec![
///     1.0, 2.0, 3.0,
///     4.0, 5.0, 6.0,
/// ]).unwrap();
///
/// assert_eq!(t.shape(), &[2, 3]);
/// assert_eq!(t.ndim(), 2);
/// assert_eq!(t.size(), 6);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor<T: Num> {
    /// Flattened data in row-major order
    data: Vec<T>,
    /// Shape of the tensor
    shape: Vec<usize>,
}

impl<T: Num + Clone> Tensor<T> {
    /// Create a new tensor from a vector and shape
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is empty, contains zero, or the data size
    /// doesn't match the shape.
    pub fn from_vec(shape: Vec<usize>, data: Vec<T>) -> Result<Self> {
        if shape.is_empty() {
            return Err(PortarError::InvalidShape {
                reason: "Shape cannot be empty".to_string(),
            });
        }

        if shape.contains(&0) {
            return Err(PortarError::InvalidShape {
                reason: "Shape dimensions cannot be zero".to_string(),
            });
        }

        let expected_size = shape.iter().product();
        if data.len() != expected_size {
            return Err(PortarError::DataShapeMismatch {
                data_size: data.len(),
                shape: shape.clone(),
                expected: expected_size,
            });
        }

        Ok(Self { data, shape })
    }

    /// Create a tensor filled with a single value
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is empty or contains zero.
    pub fn filled(shape: Vec<usize>, value: T) -> Result<Self> {
        let size = shape.iter().product();
        Self::from_vec(shape, vec![value; size])
    }

    /// Create a tensor of zeros
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is empty or contains zero.
    pub fn zeros(shape: Vec<usize>) -> Result<Self> {
        Self::filled(shape, T::zero())
    }

    /// Create a tensor of ones
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is empty or contains zero.
    pub fn ones(shape: Vec<usize>) -> Result<Self> {
        Self::filled(shape, T::one())
    }

    /// Get the shape of the tensor
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the number of dimensions
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Get the total number of elements
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Get a reference to the underlying data
    #[must_use]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Get a mutable reference to the underlying data
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Consume the tensor and return its data
    #[must_use]
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Size of one dimension
    ///
    /// # Errors
    ///
    /// Returns `Err` if `axis` is out of range.
    pub fn dim(&self, axis: usize) -> Result<usize> {
        self.shape
            .get(axis)
            .copied()
            .ok_or_else(|| PortarError::InvalidShape {
                reason: format!("Axis {axis} out of range for rank {}", self.shape.len()),
            })
    }

    /// Reinterpret the tensor with a new shape of the same total size
    ///
    /// # Errors
    ///
    /// Returns `Err` if the new shape implies a different element count.
    pub fn reshape(&self, shape: Vec<usize>) -> Result<Self> {
        Self::from_vec(shape, self.data.clone())
    }
}

/// Row-major strides for a shape
#[must_use]
pub fn strides(shape: &[usize]) -> Vec<usize> {
    let mut out = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        out[i] = out[i + 1] * shape[i + 1];
    }
    out
}

impl<T: Num + fmt::Display> fmt::Display for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={:?}, size={})", self.shape, self.data.len())
    }
}
