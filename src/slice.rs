//! Range slicing for producers.
//!
//! A producer splits `total` items into inclusive `[start, end]` ranges and
//! submits one job per range. Jobs of one phase write disjoint ranges of the
//! same buffer, which is what [`DisjointBuffer`] lets them do.

use std::cell::UnsafeCell;
use std::ops::RangeInclusive;

/// Splits `0..total` into ranges of `total / parts` items (at least one).
///
/// The last range absorbs nothing extra: a remainder becomes one more, shorter
/// range, so `parts` is a target and not an exact count.
pub fn slice_ranges(total: usize, parts: usize) -> Vec<RangeInclusive<usize>> {
    let slice_len = (total / parts.max(1)).max(1);
    ranges_of(total, slice_len)
}

/// Splits `0..total` into consecutive ranges of `slice_len` items.
pub fn ranges_of(total: usize, slice_len: usize) -> Vec<RangeInclusive<usize>> {
    let slice_len = slice_len.max(1);
    (0..total)
        .step_by(slice_len)
        .map(|start| start..=(start + slice_len - 1).min(total - 1))
        .collect()
}

/// A fixed-length buffer that concurrent jobs write through disjoint ranges.
///
/// The buffer never checks for overlap. Every `unsafe` accessor requires that
/// no other live reference covers the same indices for as long as the returned
/// slice lives. Producers guarantee this by slicing with [`slice_ranges`] and
/// by gating phases on each other.
pub struct DisjointBuffer<T> {
    cells: Box<[UnsafeCell<T>]>,
}

// Safety: access goes through the `unsafe` accessors, whose callers promise
// that no two threads touch the same element at once.
unsafe impl<T: Send> Sync for DisjointBuffer<T> {}

impl<T> DisjointBuffer<T> {
    pub fn new(data: Vec<T>) -> Self {
        DisjointBuffer {
            cells: data.into_iter().map(UnsafeCell::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn base(&self) -> *mut T {
        // UnsafeCell<T> has the same layout as T.
        self.cells.as_ptr() as *mut T
    }

    /// Mutable view of `range`.
    ///
    /// # Safety
    ///
    /// No other reference into `range` may be alive while the result is.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, range: RangeInclusive<usize>) -> &mut [T] {
        let (start, end) = range.into_inner();
        assert!(start <= end && end < self.len(), "range out of bounds");
        unsafe { std::slice::from_raw_parts_mut(self.base().add(start), end - start + 1) }
    }

    /// Shared view of the whole buffer.
    ///
    /// # Safety
    ///
    /// No mutable reference into the buffer may be alive while the result is.
    pub unsafe fn as_slice(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.base(), self.len()) }
    }

    /// Exclusive access, once no job holds the buffer anymore.
    pub fn get_mut(&mut self) -> &mut [T] {
        let len = self.len();
        unsafe { std::slice::from_raw_parts_mut(self.base(), len) }
    }

    pub fn into_vec(self) -> Vec<T> {
        self.cells
            .into_vec()
            .into_iter()
            .map(UnsafeCell::into_inner)
            .collect()
    }
}

impl<T: Clone> DisjointBuffer<T> {
    pub fn filled(value: T, len: usize) -> Self {
        DisjointBuffer::new(vec![value; len])
    }
}

impl<T> From<Vec<T>> for DisjointBuffer<T> {
    fn from(data: Vec<T>) -> Self {
        DisjointBuffer::new(data)
    }
}
