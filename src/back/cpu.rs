use crate::back::{check_len, gemm_dims, same_shape, Backend, BufferId, Layout, MatrixBuffer, TargetSlot};
use crate::error::{mismatch, Result};
use crate::ten::Shape;
use ndarray::{Array2, ArrayView2, Axis, Zip};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug)]
pub struct CpuMatrix {
    id: BufferId,
    shape: Shape,
    data: RefCell<Array2<f32>>,
}

pub type CpuBuffer = Rc<CpuMatrix>;

impl MatrixBuffer<CpuBackend> for Rc<CpuMatrix> {
    fn id(&self) -> BufferId {
        self.id
    }

    fn shape(&self) -> Shape {
        self.shape
    }

    fn write(&self, _: &mut CpuBackend, data: &[f32]) -> Result<()> {
        check_len(self.shape, data)?;
        let mut m = self.data.borrow_mut();
        for (dst, src) in m.iter_mut().zip(data) {
            *dst = *src;
        }
        Ok(())
    }

    fn read(&self, _: &mut CpuBackend) -> Result<Vec<f32>> {
        Ok(self.data.borrow().iter().copied().collect())
    }
}

/// Reference backend. Everything runs synchronously on the calling thread.
#[derive(Debug, Default)]
pub struct CpuBackend {
    target: TargetSlot,
    lastid: BufferId,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn genid(&mut self) -> BufferId {
        self.lastid += 1;
        self.lastid
    }
}

fn view(m: &Array2<f32>, l: Layout) -> ArrayView2<'_, f32> {
    match l {
        Layout::Normal => m.view(),
        Layout::Transposed => m.t(),
    }
}

impl Backend for CpuBackend {
    type Buffer = Rc<CpuMatrix>;

    fn buffer(&mut self, shape: &Shape) -> Result<Self::Buffer> {
        if shape.is_empty() {
            return mismatch(format!("matrix {shape} has no elements"));
        }
        Ok(Rc::new(CpuMatrix {
            id: self.genid(),
            shape: *shape,
            data: RefCell::new(Array2::zeros((shape.rows(), shape.cols()))),
        }))
    }

    fn zero(&mut self, buf: &Self::Buffer) -> Result<()> {
        let _bind = self.target.bind(buf.id, &[])?;
        buf.data.borrow_mut().fill(0.0);
        Ok(())
    }

    fn gemm(
        &mut self,
        a: &Self::Buffer,
        la: Layout,
        b: &Self::Buffer,
        lb: Layout,
        out: &Self::Buffer,
        accumulate: bool,
    ) -> Result<()> {
        gemm_dims(a.shape, la, b.shape, lb, out.shape)?;
        let _bind = self.target.bind(out.id, &[a.id, b.id])?;

        let am = a.data.borrow();
        let bm = b.data.borrow();
        let prod = view(&am, la).dot(&view(&bm, lb));
        let mut o = out.data.borrow_mut();
        if accumulate {
            *o += &prod;
        } else {
            o.assign(&prod);
        }
        Ok(())
    }

    fn add_row(&mut self, row: &Self::Buffer, out: &Self::Buffer) -> Result<()> {
        if row.shape != Shape::new(out.shape.cols(), 1) {
            return mismatch(format!(
                "row {} cannot be added to every row of {}",
                row.shape, out.shape
            ));
        }
        let _bind = self.target.bind(out.id, &[row.id])?;
        let r = row.data.borrow();
        let mut o = out.data.borrow_mut();
        *o += &r.row(0);
        Ok(())
    }

    fn col_sum(&mut self, x: &Self::Buffer, out: &Self::Buffer) -> Result<()> {
        if out.shape != Shape::new(x.shape.cols(), 1) {
            return mismatch(format!(
                "column sums of {} do not fit into {}",
                x.shape, out.shape
            ));
        }
        let _bind = self.target.bind(out.id, &[x.id])?;
        let sums = x.data.borrow().sum_axis(Axis(0));
        out.data.borrow_mut().row_mut(0).assign(&sums);
        Ok(())
    }

    fn relu(&mut self, x: &Self::Buffer, y: &Self::Buffer) -> Result<()> {
        same_shape("relu", x.shape, y.shape)?;
        let _bind = self.target.bind(y.id, &[x.id])?;
        Zip::from(&mut *y.data.borrow_mut())
            .and(&*x.data.borrow())
            .for_each(|y, &x| *y = x.max(0.0));
        Ok(())
    }

    fn relu_backward(
        &mut self,
        y: &Self::Buffer,
        dy: &Self::Buffer,
        dx: &Self::Buffer,
    ) -> Result<()> {
        same_shape("relu gradient", y.shape, dy.shape)?;
        same_shape("relu gradient", y.shape, dx.shape)?;
        let _bind = self.target.bind(dx.id, &[y.id, dy.id])?;
        Zip::from(&mut *dx.data.borrow_mut())
            .and(&*y.data.borrow())
            .and(&*dy.data.borrow())
            .for_each(|dx, &y, &dy| {
                if y > 0.0 {
                    *dx += dy;
                }
            });
        Ok(())
    }

    fn loss(
        &mut self,
        expected: &Self::Buffer,
        actual: &Self::Buffer,
        dloss: &Self::Buffer,
    ) -> Result<()> {
        same_shape("loss", expected.shape, actual.shape)?;
        same_shape("loss", actual.shape, dloss.shape)?;
        let _bind = self.target.bind(dloss.id, &[expected.id, actual.id])?;
        Zip::from(&mut *dloss.data.borrow_mut())
            .and(&*expected.data.borrow())
            .and(&*actual.data.borrow())
            .for_each(|d, &e, &a| *d = a - e);
        Ok(())
    }

    fn scaled_add(
        &mut self,
        target: &Self::Buffer,
        other: &Self::Buffer,
        scalar: f32,
    ) -> Result<()> {
        same_shape("scaled add", target.shape, other.shape)?;
        let _bind = self.target.bind(target.id, &[other.id])?;
        target
            .data
            .borrow_mut()
            .scaled_add(scalar, &*other.data.borrow());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;

    fn upload(b: &mut CpuBackend, w: usize, h: usize, v: &[f32]) -> CpuBuffer {
        let buf = b.buffer(&Shape::new(w, h)).unwrap();
        buf.write(b, v).unwrap();
        buf
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut b = CpuBackend::new();
        let data = [1.5, -2.0, 0.25, 1e-3, 3.0, 42.0];
        let buf = upload(&mut b, 3, 2, &data);
        assert_eq!(buf.read(&mut b).unwrap(), data);
    }

    #[test]
    fn test_write_wrong_size() {
        let mut b = CpuBackend::new();
        let buf = b.buffer(&Shape::new(2, 2)).unwrap();
        let err = buf.write(&mut b, &[1.0; 5]).unwrap_err();
        assert!(matches!(*err, ErrorKind::SizeMismatch { got: 5, .. }));
    }

    #[test]
    fn test_gemm_layouts() {
        let mut b = CpuBackend::new();
        // a = [[1, 2], [3, 4]], c = [[5], [6]]
        let a = upload(&mut b, 2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let c = upload(&mut b, 1, 2, &[5.0, 6.0]);
        let out = b.buffer(&Shape::new(1, 2)).unwrap();

        b.gemm(&a, Layout::Normal, &c, Layout::Normal, &out, false).unwrap();
        assert_eq!(out.read(&mut b).unwrap(), [17.0, 39.0]);

        b.gemm(&a, Layout::Transposed, &c, Layout::Normal, &out, true).unwrap();
        assert_eq!(out.read(&mut b).unwrap(), [17.0 + 23.0, 39.0 + 34.0]);

        let row = b.buffer(&Shape::new(2, 1)).unwrap();
        b.gemm(&c, Layout::Transposed, &a, Layout::Normal, &row, false).unwrap();
        assert_eq!(row.read(&mut b).unwrap(), [23.0, 34.0]);
    }

    #[test]
    fn test_bias_and_col_sum() {
        let mut b = CpuBackend::new();
        let m = upload(&mut b, 2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let bias = upload(&mut b, 2, 1, &[10.0, 20.0]);
        b.add_row(&bias, &m).unwrap();
        assert_eq!(
            m.read(&mut b).unwrap(),
            [11.0, 22.0, 13.0, 24.0, 15.0, 26.0]
        );

        let sums = b.buffer(&Shape::new(2, 1)).unwrap();
        b.col_sum(&m, &sums).unwrap();
        assert_eq!(sums.read(&mut b).unwrap(), [39.0, 72.0]);

        let wrong = b.buffer(&Shape::new(1, 2)).unwrap();
        assert!(b.col_sum(&m, &wrong).is_err());
    }

    #[test]
    fn test_scaled_add_and_loss() {
        let mut b = CpuBackend::new();
        let v = upload(&mut b, 2, 1, &[1.0, 1.0]);
        let g = upload(&mut b, 2, 1, &[2.0, -4.0]);
        v.scaled_add(&mut b, &g, -0.5).unwrap();
        assert_eq!(v.read(&mut b).unwrap(), [0.0, 3.0]);

        let d = b.buffer(&Shape::new(2, 1)).unwrap();
        b.loss(&g, &v, &d).unwrap();
        assert_eq!(d.read(&mut b).unwrap(), [-2.0, 7.0]);
    }

    #[test]
    fn test_kernel_cannot_target_its_input() {
        let mut b = CpuBackend::new();
        let v = upload(&mut b, 2, 1, &[1.0, -1.0]);
        let err = b.relu(&v, &v).unwrap_err();
        assert!(matches!(*err, ErrorKind::TargetBinding { .. }));
        assert_eq!(b.target.bound(), None);
        // nothing was written
        assert_eq!(v.read(&mut b).unwrap(), [1.0, -1.0]);
    }
}
