//! Fixed-dimension numeric buffers for actions and sensor readings
//!
//! A `ShapedBuffer` is tagged with the kind of data it carries so an action
//! can never be passed where readings are expected. Its length is checked
//! against the counts the robot reports at connect time.

use crate::{CloneEnvError, Result};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Marker for the kind of values a buffer carries
pub trait BufferKind {
    const NAME: &'static str;
}

/// One value per actuator
#[derive(Debug)]
pub enum Actuation {}

/// One value per sensor
#[derive(Debug)]
pub enum Sensing {}

impl BufferKind for Actuation {
    const NAME: &'static str = "action";
}

impl BufferKind for Sensing {
    const NAME: &'static str = "readings";
}

/// Immutable ordered sequence of values tagged with its kind
pub struct ShapedBuffer<K> {
    values: Arc<[f64]>,
    _kind: PhantomData<fn() -> K>,
}

pub type ActionVector = ShapedBuffer<Actuation>;
pub type Readings = ShapedBuffer<Sensing>;

impl<K: BufferKind> ShapedBuffer<K> {
    pub fn new(values: impl Into<Vec<f64>>) -> Self {
        let values: Vec<f64> = values.into();
        Self {
            values: Arc::from(values),
            _kind: PhantomData,
        }
    }

    /// Buffer of `len` copies of `value`
    pub fn filled(len: usize, value: f64) -> Self {
        Self::new(vec![value; len])
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.values.iter()
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.values.to_vec()
    }

    /// Fails with a shape error unless the buffer holds exactly `expected` values
    pub fn check_dim(&self, expected: usize) -> Result<()> {
        if self.values.len() != expected {
            return Err(CloneEnvError::Shape {
                kind: K::NAME,
                expected,
                actual: self.values.len(),
            });
        }
        Ok(())
    }
}

impl ActionVector {
    /// Fully released actuators
    pub fn release(len: usize) -> Self {
        Self::filled(len, -1.0)
    }

    /// Rejects NaN and infinite values, which no actuator can act on
    pub fn ensure_finite(&self) -> Result<()> {
        match self.values.iter().position(|v| !v.is_finite()) {
            Some(index) => Err(CloneEnvError::InvalidAction(format!(
                "value at index {} is {}",
                index, self.values[index]
            ))),
            None => Ok(()),
        }
    }
}

impl<K> Clone for ShapedBuffer<K> {
    fn clone(&self) -> Self {
        Self {
            values: Arc::clone(&self.values),
            _kind: PhantomData,
        }
    }
}

impl<K> PartialEq for ShapedBuffer<K> {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl<K: BufferKind> fmt::Debug for ShapedBuffer<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple(K::NAME).field(&&*self.values).finish()
    }
}

impl<K: BufferKind> From<Vec<f64>> for ShapedBuffer<K> {
    fn from(values: Vec<f64>) -> Self {
        Self::new(values)
    }
}

impl<K: BufferKind> From<&[f64]> for ShapedBuffer<K> {
    fn from(values: &[f64]) -> Self {
        Self::new(values.to_vec())
    }
}

impl<K: BufferKind, const N: usize> From<[f64; N]> for ShapedBuffer<K> {
    fn from(values: [f64; N]) -> Self {
        Self::new(values.to_vec())
    }
}
