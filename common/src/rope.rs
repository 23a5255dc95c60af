use smallvec::{SmallVec, ToSmallVec};

/// The size of the [`SmallVec`] to use in [`Rope`] and [`RopeMut`].
///
/// Four segments cover the common case of a model exposing weight and bias
/// buffers for one encoder and one decoder.
const SMALLVEC_LEN: usize = 4;

/// A "rope" of immutable slices: non-contiguous buffers viewed as one
/// logical vector.
#[derive(Debug, Clone)]
pub struct Rope<'a, S> {
    /// The immutable slices in question.
    data: SmallVec<[&'a [S]; SMALLVEC_LEN]>,
}

/// A "rope" of mutable slices.
///
/// Model implementations hand out a [`RopeMut`] over their parameter and
/// gradient buffers so the collective layer can average and broadcast them
/// without knowing the model's internal layout.
#[derive(Debug)]
pub struct RopeMut<'a, S> {
    /// The mutable slices in question.
    data: SmallVec<[&'a mut [S]; SMALLVEC_LEN]>,
}

impl<'a, S> Rope<'a, S> {
    /// Create a new [`Rope`] containing data from a vector of immutable slices.
    pub fn new(data: &[&'a [S]]) -> Self {
        Self {
            data: data.to_smallvec(),
        }
    }

    /// Get the total length of the [`Rope`].
    pub fn len(&self) -> usize {
        self.data.iter().map(|s| s.len()).sum()
    }

    /// Checks if the [`Rope`] is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge two [`Rope`] together, `self` first.
    pub fn merge(mut self, rope2: Rope<'a, S>) -> Rope<'a, S> {
        self.data.extend(rope2.data);

        self
    }

    /// Iterates over all elements in segment order.
    pub fn iter(&self) -> impl Iterator<Item = &S> {
        self.data.iter().flat_map(|s| s.iter())
    }

    /// Copies the rope's contents into one contiguous vector.
    pub fn to_vec(&self) -> Vec<S>
    where
        S: Copy,
    {
        let mut out = Vec::with_capacity(self.len());
        for segment in &self.data {
            out.extend_from_slice(segment);
        }
        out
    }
}

impl<'a, S> RopeMut<'a, S> {
    /// Create a new [`RopeMut`] containing data from an array of mutable slices.
    pub fn new<const N: usize>(data: [&'a mut [S]; N]) -> Self {
        Self {
            data: data.into_iter().collect(),
        }
    }

    /// Get the total length of the [`RopeMut`].
    pub fn len(&self) -> usize {
        self.data.iter().map(|s| s.len()).sum()
    }

    /// Checks if the [`RopeMut`] is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge two [`RopeMut`] together, `self` first.
    pub fn merge(mut self, rope2: RopeMut<'a, S>) -> RopeMut<'a, S> {
        self.data.extend(rope2.data);

        self
    }

    /// Iterates over all elements in segment order.
    pub fn iter(&self) -> impl Iterator<Item = &S> {
        self.data.iter().flat_map(|s| s.iter())
    }

    /// Copies the rope's contents into one contiguous vector.
    pub fn to_vec(&self) -> Vec<S>
    where
        S: Copy,
    {
        let mut out = Vec::with_capacity(self.len());
        for segment in &self.data {
            out.extend_from_slice(segment);
        }
        out
    }

    /// Copies the data from the slice into the underlying buffers.
    ///
    /// # Panics
    /// If the slice doesn't have the same length as the [`RopeMut`].
    pub fn copy_from_slice(&mut self, slice: &[S])
    where
        S: Copy,
    {
        assert_eq!(
            self.len(),
            slice.len(),
            "Expected `self` and `slice` to have the same length but got {} and {}, respectively",
            self.len(),
            slice.len()
        );

        let mut offset = 0;
        for segment in self.data.iter_mut() {
            let len = segment.len();
            segment.copy_from_slice(&slice[offset..(offset + len)]);
            offset += len;
        }
    }
}

impl<'a, S> From<RopeMut<'a, S>> for Rope<'a, S> {
    fn from(value: RopeMut<'a, S>) -> Self {
        Self {
            data: value.data.into_iter().map(|i| &*i).collect(),
        }
    }
}
