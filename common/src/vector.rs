use bytemuck::{Pod, Zeroable};

use std::ops::{Index, IndexMut};

/// A fixed-size point/vector type used for particle positions, velocities,
/// and per-particle descriptor rows.
///
/// This attempts to compile invalid types
/// ```compile_fail
/// use common::vector::Vector;
/// fn test_addition_invalid_types() {
///     let x = Vector::new([0f64, 1.5f64]);
///     let y = Vector::new([1.3f32, 22.5f32]);
///     assert_eq!(x + y, Vector::new([1.3, 24.0]));
/// }
/// ```
#[derive(Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct Vector<T, const DIMS: usize>([T; DIMS]);

impl<T, const DIMS: usize> Clone for Vector<T, DIMS>
where
    [T; DIMS]: Clone,
{
    fn clone(&self) -> Self {
        Vector(self.0.clone())
    }
}
impl<T, const DIMS: usize> Copy for Vector<T, DIMS> where [T; DIMS]: Copy {}

impl<T: num::Zero, const DIMS: usize> Vector<T, DIMS> {
    /// The additive identity.
    #[inline]
    pub fn zero() -> Self {
        Vector::from_idx(|_| T::zero())
    }
}

impl<T, const DIMS: usize> Vector<T, DIMS> {
    /// Wraps an array as a [`Vector`].
    pub fn new(data: [T; DIMS]) -> Vector<T, DIMS> {
        Self(data)
    }

    /// Fills every component with a copy of `value`.
    pub fn broadcast(value: T) -> Self
    where
        T: Clone,
    {
        Self::from_idx(|_| value.clone())
    }

    /// Borrows the components as a slice.
    #[inline]
    pub fn as_array(&self) -> &[T] {
        &self.0
    }

    /// Mutably borrows the components as a slice.
    #[inline]
    pub fn as_array_mut(&mut self) -> &mut [T] {
        &mut self.0
    }

    /// Consumes the vector, yielding its components in order.
    pub fn iter(self) -> impl Iterator<Item = T> {
        self.0.into_iter()
    }

    /// Applies `map_fn` to every component.
    #[inline]
    pub fn map<U>(self, map_fn: impl Fn(T) -> U) -> Vector<U, DIMS> {
        Vector(self.0.map(map_fn))
    }

    /// Builds a vector from a per-index function. The function may carry
    /// mutable state, e.g. a random number generator.
    #[inline]
    pub fn from_idx(idx_fn: impl FnMut(usize) -> T) -> Self {
        Self(std::array::from_fn(idx_fn))
    }

    /// Sums the components.
    #[inline]
    pub fn sum(self) -> T
    where
        T: std::ops::Add<Output = T> + num::Zero,
    {
        self.0.into_iter().reduce(|a, b| a + b).unwrap_or(T::zero())
    }
}

impl<T: num::Float, const DIMS: usize> Vector<T, DIMS> {
    /// The squared Euclidean norm.
    #[inline]
    pub fn norm_sq(self) -> T {
        self.map(|i| i * i).sum()
    }

    /// The inner product with `rhs`.
    #[inline]
    pub fn dot(self, rhs: Self) -> T {
        (self * rhs).sum()
    }

    /// True when every component is finite (no NaN, no infinity).
    #[inline]
    pub fn is_finite(self) -> bool {
        self.0.into_iter().all(|i| i.is_finite())
    }
}

impl<T, const DIMS: usize> Index<usize> for Vector<T, DIMS> {
    type Output = T;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl<T, const DIMS: usize> IndexMut<usize> for Vector<T, DIMS> {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.0[index]
    }
}

impl<T, const DIMS: usize> From<[T; DIMS]> for Vector<T, DIMS> {
    fn from(value: [T; DIMS]) -> Self {
        Self(value)
    }
}

/// Implements a component-wise unary operator for [`Vector`].
macro_rules! impl_unary_operation {
    ($op:ident) => {
        paste::paste! {
            impl<T: Copy, U, const DIMS: usize> std::ops::$op for Vector<T, DIMS>
            where
                T: std::ops::$op<Output = U>,
            {
                type Output = Vector<U, DIMS>;

                fn [< $op:lower >](self) -> Self::Output {
                    Vector::from_idx(|i| self[i].[< $op:lower >]())
                }
            }
        }
    };
}

/// Implements component-wise binary operators (vector-vector and
/// vector-scalar) for [`Vector`].
macro_rules! impl_binary_operation {
    ($($op:ident),+$(,)?) => {
        paste::paste! {
            $(impl<T: Copy, U: Copy, V, const DIMS: usize> std::ops::$op<Vector<U, DIMS>> for Vector<T, DIMS>
            where
                T: std::ops::$op<U, Output = V>,
            {
                type Output = Vector<V, DIMS>;

                fn [< $op:lower >](self, rhs: Vector<U, DIMS>) -> Self::Output {
                    Vector::from_idx(|i| self[i].[< $op:lower >](rhs[i]))
                }
            })+
        }

        paste::paste! {
            $(impl<T: Copy, U: Copy + num::Num, V, const DIMS: usize> std::ops::$op<U> for Vector<T, DIMS>
            where
                T: std::ops::$op<U, Output = V>,
            {
                type Output = Vector<V, DIMS>;

                fn [< $op:lower >](self, rhs: U) -> Self::Output {
                    let rhs = Vector::<U, DIMS>::broadcast(rhs);
                    Vector::from_idx(|i| self[i].[< $op:lower >](rhs[i]))
                }
            })+
        }
    };
}

/// Implements the compound-assignment forms of the binary operators.
macro_rules! impl_binary_assign_operation {
    ($($op:ident),+$(,)?) => {
        paste::paste! {
            $(impl<T: Copy, U: Copy, const DIMS: usize> std::ops::[< $op Assign >]<Vector<U, DIMS>> for Vector<T, DIMS>
            where
                T: std::ops::[< $op >]<U, Output=T>,
            {
                fn [< $op:lower _assign >](&mut self, rhs: Vector<U, DIMS>) {
                    use std::ops::$op;

                    *self = Vector::<T, DIMS>::[< $op:lower >](*self, rhs);
                }
            })+
        }

        paste::paste! {
            $(impl<T: Copy, U: Copy + num::Num, const DIMS: usize> std::ops::[< $op Assign >]<U> for Vector<T, DIMS>
            where
                T: std::ops::[< $op >]<U, Output=T>,
            {
                fn [< $op:lower _assign >](&mut self, rhs: U) {
                    use std::ops::$op;

                    let rhs = Vector::<U, DIMS>::broadcast(rhs);
                    *self = Vector::<T, DIMS>::[< $op:lower >](*self, rhs);
                }
            })+
        }
    };
}

impl_unary_operation!(Neg);
impl_binary_operation!(Add, Sub, Mul, Div);
impl_binary_assign_operation!(Add, Sub, Mul, Div);

#[cfg(test)]
mod tests {
    use super::Vector;

    #[test]
    fn test_addition_f64() {
        let x = Vector([0f64, 1.5]);
        let y = Vector([1.3, 22.5]);

        assert_eq!(x + y, Vector([1.3, 24.0]));
    }

    #[test]
    fn test_scalar_broadcast() {
        let x = Vector([1.0f64, 2.0, 3.0]);

        assert_eq!(x * 2.0, Vector([2.0, 4.0, 6.0]));
    }

    #[test]
    fn test_norm_and_dot() {
        let x = Vector([3.0f64, 4.0]);
        let y = Vector([1.0f64, 0.5]);

        assert_eq!(x.norm_sq(), 25.0);
        assert_eq!(x.dot(y), 5.0);
    }

    #[test]
    fn test_from_idx_allows_stateful_closures() {
        let mut counter = 0.0f64;
        let x = Vector::<f64, 3>::from_idx(|_| {
            counter += 1.0;
            counter
        });

        assert_eq!(x, Vector([1.0, 2.0, 3.0]));
    }

    #[test]
    fn test_nan_detection() {
        let x = Vector([0.0f64, f64::NAN, 1.0]);
        assert!(!x.is_finite());
        assert!(Vector([0.0f64, 1.0, 2.0]).is_finite());
    }
}
