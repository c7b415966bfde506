//! Values exchanged by payload operations and the reductions applied to them.
//!
//! The communicator does not care about the numeric representation of a payload. It only needs
//! to (de-)serialize it and to count its elements for the communication statistics.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{Error, Violation};

/// A value that can be moved between parties by payload operations.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The number of elements in this payload, used to approximate communication volume.
    fn num_elements(&self) -> usize;
}

/// A payload that can be combined element-wise by `reduce` and `all_reduce`.
pub trait Reducible: Payload {
    /// Combines `other` into `self`.
    ///
    /// Fails if the two payloads do not have the same number of elements.
    fn reduce_with(&mut self, other: Self, op: ReduceOp) -> Result<(), Error>;
}

/// The reduction applied by `reduce` and `all_reduce`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    /// Element-wise sum, wrapping on integer overflow.
    #[default]
    Sum,
    /// Element-wise product, wrapping on integer overflow.
    Product,
    /// Element-wise minimum.
    Min,
    /// Element-wise maximum.
    Max,
}

/// A single element of a payload.
pub trait Element: Copy + PartialOrd + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Combines two elements with the given reduction.
    fn combine(self, other: Self, op: ReduceOp) -> Self;
}

macro_rules! impl_int_element {
    ($($t:ty),*) => {$(
        impl Element for $t {
            #[inline]
            fn combine(self, other: Self, op: ReduceOp) -> Self {
                match op {
                    ReduceOp::Sum => self.wrapping_add(other),
                    ReduceOp::Product => self.wrapping_mul(other),
                    ReduceOp::Min => self.min(other),
                    ReduceOp::Max => self.max(other),
                }
            }
        }
    )*};
}

macro_rules! impl_float_element {
    ($($t:ty),*) => {$(
        impl Element for $t {
            #[inline]
            fn combine(self, other: Self, op: ReduceOp) -> Self {
                match op {
                    ReduceOp::Sum => self + other,
                    ReduceOp::Product => self * other,
                    ReduceOp::Min => self.min(other),
                    ReduceOp::Max => self.max(other),
                }
            }
        }
    )*};
}

impl_int_element!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize);
impl_float_element!(f32, f64);

macro_rules! impl_scalar_payload {
    ($($t:ty),*) => {$(
        impl Payload for $t {
            #[inline]
            fn num_elements(&self) -> usize {
                1
            }
        }

        impl Reducible for $t {
            #[inline]
            fn reduce_with(&mut self, other: Self, op: ReduceOp) -> Result<(), Error> {
                *self = self.combine(other, op);
                Ok(())
            }
        }
    )*};
}

impl_scalar_payload!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

impl<T: Element> Payload for Vec<T> {
    fn num_elements(&self) -> usize {
        self.len()
    }
}

impl<T: Element> Reducible for Vec<T> {
    fn reduce_with(&mut self, other: Self, op: ReduceOp) -> Result<(), Error> {
        if self.len() != other.len() {
            return Err(Violation::LengthMismatch {
                expected: self.len(),
                actual: other.len(),
            }
            .into());
        }
        self.iter_mut()
            .zip(other)
            .for_each(|(a, b)| *a = a.combine(b, op));
        Ok(())
    }
}

/// The empty payload, e.g. of a barrier.
impl Payload for () {
    fn num_elements(&self) -> usize {
        0
    }
}

/// Folds the contributions of all parties in rank order.
///
/// Every party folding the same contributions obtains the same result, even for
/// non-associative floating point sums.
pub(crate) fn fold<T: Reducible>(contributions: Vec<T>, op: ReduceOp) -> Result<Option<T>, Error> {
    let mut contributions = contributions.into_iter();
    let Some(mut acc) = contributions.next() else {
        return Ok(None);
    };
    for contribution in contributions {
        acc.reduce_with(contribution, op)?;
    }
    Ok(Some(acc))
}

/// Folds batches of contributions item by item.
pub(crate) fn fold_batches<T: Reducible>(
    batches: Vec<Vec<T>>,
    op: ReduceOp,
) -> Result<Vec<T>, Error> {
    let mut batches = batches.into_iter();
    let Some(mut acc) = batches.next() else {
        return Ok(vec![]);
    };
    for batch in batches {
        if batch.len() != acc.len() {
            return Err(Violation::LengthMismatch {
                expected: acc.len(),
                actual: batch.len(),
            }
            .into());
        }
        for (a, b) in acc.iter_mut().zip(batch) {
            a.reduce_with(b, op)?;
        }
    }
    Ok(acc)
}
