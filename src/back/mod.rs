pub mod cpu;
#[cfg(feature = "wgpu")]
pub mod wgpu;

use crate::error::{mismatch, ErrorKind, Result};
use crate::ten::Shape;
use std::cell::Cell;

pub type BufferId = u64;

/// How a gemm operand is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Normal,
    Transposed,
}

impl Layout {
    pub fn apply(self, s: Shape) -> Shape {
        match self {
            Layout::Normal => s,
            Layout::Transposed => s.transposed(),
        }
    }

    pub fn is_transposed(self) -> bool {
        self == Layout::Transposed
    }
}

/// Dense matrix compute device.
///
/// Every kernel writes exactly one destination buffer, which it has to bind
/// through the backend's [`TargetSlot`] for the duration of the dispatch.
pub trait Backend: Sized {
    type Buffer: MatrixBuffer<Self>;

    /// Allocate a zero filled buffer.
    fn buffer(&mut self, shape: &Shape) -> Result<Self::Buffer>;

    fn zero(&mut self, buf: &Self::Buffer) -> Result<()>;

    /// `out = op(a) * op(b)`, or `out += op(a) * op(b)` when accumulating.
    fn gemm(
        &mut self,
        a: &Self::Buffer,
        la: Layout,
        b: &Self::Buffer,
        lb: Layout,
        out: &Self::Buffer,
        accumulate: bool,
    ) -> Result<()>;

    /// `out[r, c] += row[0, c]` for every row.
    fn add_row(&mut self, row: &Self::Buffer, out: &Self::Buffer) -> Result<()>;

    /// `out[0, c] = sum_r x[r, c]`
    fn col_sum(&mut self, x: &Self::Buffer, out: &Self::Buffer) -> Result<()>;

    fn relu(&mut self, x: &Self::Buffer, y: &Self::Buffer) -> Result<()>;

    /// `dx += dy * (y > 0)`
    fn relu_backward(
        &mut self,
        y: &Self::Buffer,
        dy: &Self::Buffer,
        dx: &Self::Buffer,
    ) -> Result<()>;

    /// `dloss = actual - expected`
    fn loss(
        &mut self,
        expected: &Self::Buffer,
        actual: &Self::Buffer,
        dloss: &Self::Buffer,
    ) -> Result<()>;

    /// `target += scalar * other`
    fn scaled_add(&mut self, target: &Self::Buffer, other: &Self::Buffer, scalar: f32)
        -> Result<()>;

    /// Block until all submitted work has completed.
    fn finish(&mut self) -> Result<()>;
}

/// Every buffer implementation must be able to move data to and from the host
pub trait MatrixBuffer<B: Backend<Buffer = Self>>: Sized + Clone {
    fn id(&self) -> BufferId;
    fn shape(&self) -> Shape;
    fn write(&self, b: &mut B, data: &[f32]) -> Result<()>;
    fn read(&self, b: &mut B) -> Result<Vec<f32>>;

    fn scaled_add(&self, b: &mut B, other: &Self, scalar: f32) -> Result<()> {
        b.scaled_add(self, other, scalar)
    }

    fn same_shape(&self, other: &Self) -> bool {
        self.shape() == other.shape()
    }
}

/// The single binding point for kernel destinations.
#[derive(Debug, Default)]
pub struct TargetSlot {
    bound: Cell<Option<BufferId>>,
}

/// Releases the binding on drop.
#[derive(Debug)]
pub struct TargetGuard<'a> {
    slot: &'a TargetSlot,
    target: BufferId,
}

impl TargetGuard<'_> {
    pub fn target(&self) -> BufferId {
        self.target
    }
}

impl Drop for TargetGuard<'_> {
    fn drop(&mut self) {
        self.slot.bound.set(None);
    }
}

impl TargetSlot {
    pub fn bind(&self, target: BufferId, inputs: &[BufferId]) -> Result<TargetGuard<'_>> {
        if let Some(held) = self.bound.get() {
            return Err(ErrorKind::TargetBinding {
                buffer: target,
                reason: format!("buffer {held} is still bound"),
            }
            .into());
        }
        if inputs.contains(&target) {
            return Err(ErrorKind::TargetBinding {
                buffer: target,
                reason: "buffer is also read by the kernel".into(),
            }
            .into());
        }
        self.bound.set(Some(target));
        Ok(TargetGuard { slot: self, target })
    }

    pub fn bound(&self) -> Option<BufferId> {
        self.bound.get()
    }
}

/// Check `op(a) * op(b) -> out` and return `(m, n, k)`.
pub(crate) fn gemm_dims(
    a: Shape,
    la: Layout,
    b: Shape,
    lb: Layout,
    out: Shape,
) -> Result<(usize, usize, usize)> {
    let a = la.apply(a);
    let b = lb.apply(b);
    if a.cols() != b.rows() {
        return mismatch(format!(
            "left operand width ({}) must equal right operand height ({})",
            a.cols(),
            b.rows()
        ));
    }
    if out.rows() != a.rows() || out.cols() != b.cols() {
        return mismatch(format!(
            "product is {}x{} but destination is {out}",
            a.rows(),
            b.cols()
        ));
    }
    Ok((a.rows(), b.cols(), a.cols()))
}

pub(crate) fn same_shape(what: &str, a: Shape, b: Shape) -> Result<()> {
    if a != b {
        return mismatch(format!("{what}: {a} does not match {b}"));
    }
    Ok(())
}

pub(crate) fn check_len(shape: Shape, data: &[f32]) -> Result<()> {
    if data.len() != shape.len() {
        return Err(ErrorKind::SizeMismatch {
            got: data.len(),
            shape,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_slot_is_exclusive() {
        let slot = TargetSlot::default();
        let guard = slot.bind(1, &[2, 3]).unwrap();
        assert_eq!(guard.target(), 1);
        let err = slot.bind(4, &[]).unwrap_err();
        assert!(matches!(*err, ErrorKind::TargetBinding { buffer: 4, .. }));
        drop(guard);
        assert_eq!(slot.bound(), None);
        assert!(slot.bind(4, &[]).is_ok());
    }

    #[test]
    fn test_slot_rejects_feedback() {
        let slot = TargetSlot::default();
        let err = slot.bind(2, &[1, 2]).unwrap_err();
        assert!(matches!(*err, ErrorKind::TargetBinding { buffer: 2, .. }));
        assert_eq!(slot.bound(), None);
    }

    #[test]
    fn test_gemm_dims() {
        let w = Shape::new(3, 2);
        let x = Shape::new(4, 3);
        assert_eq!(
            gemm_dims(w, Layout::Normal, x, Layout::Normal, Shape::new(4, 2)).unwrap(),
            (2, 4, 3)
        );
        assert_eq!(
            gemm_dims(x, Layout::Transposed, w, Layout::Transposed, Shape::new(2, 4)).unwrap(),
            (4, 2, 3)
        );
        assert!(gemm_dims(w, Layout::Normal, w, Layout::Normal, Shape::new(3, 2)).is_err());
    }
}
