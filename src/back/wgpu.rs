use crate::back::{
    check_len, gemm_dims, same_shape, Backend, BufferId, Layout, MatrixBuffer, TargetSlot,
};
use crate::error::{mismatch, ErrorKind, Result};
use crate::ten::Shape;
use log::{debug, info};
use std::borrow::Cow;
use std::rc::Rc;
use wgpu::util::{BufferInitDescriptor, DeviceExt};
use wgpu::{
    Adapter, BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayout,
    BindGroupLayoutDescriptor, Buffer, BufferDescriptor, BufferUsages, CommandEncoderDescriptor,
    ComputePassDescriptor, ComputePipeline, ComputePipelineDescriptor, Device, DeviceDescriptor,
    Features, Instance, Label, Limits, Maintain, MapMode, PipelineLayout, PowerPreference, Queue,
    RequestAdapterOptions, ShaderModuleDescriptor, ShaderSource,
};

const GEMM: &str = include_str!("../kernel/gemm.wgsl");
const MAP: &str = include_str!("../kernel/map.wgsl");
const COL_SUM: &str = include_str!("../kernel/col_sum.wgsl");

const MAX_GROUPS: usize = 65535;

#[derive(Debug)]
pub struct WgpuMatrix {
    id: BufferId,
    shape: Shape,
    buffer: Buffer,
}

pub type WgpuBuffer = Rc<WgpuMatrix>;

impl MatrixBuffer<WgpuBackend> for Rc<WgpuMatrix> {
    fn id(&self) -> BufferId {
        self.id
    }

    fn shape(&self) -> Shape {
        self.shape
    }

    fn write(&self, e: &mut WgpuBackend, data: &[f32]) -> Result<()> {
        check_len(self.shape, data)?;
        let data_buffer = e.device.create_buffer_init(&BufferInitDescriptor {
            label: Some("upload"),
            contents: bytemuck::cast_slice(data),
            usage: BufferUsages::COPY_SRC,
        });

        let mut encoder = e.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(&data_buffer, 0, &self.buffer, 0, data_buffer.size());
        e.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read(&self, e: &mut WgpuBackend) -> Result<Vec<f32>> {
        let recv_buffer = e.device.create_buffer(&BufferDescriptor {
            label: Some("download"),
            size: self.buffer.size(),
            usage: BufferUsages::COPY_DST | BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = e.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &recv_buffer, 0, self.buffer.size());
        e.queue.submit(Some(encoder.finish()));

        let bufslice = recv_buffer.slice(..);
        let (s, r) = futures_intrusive::channel::shared::oneshot_channel();
        bufslice.map_async(MapMode::Read, move |v| {
            let _ = s.send(v);
        });
        e.device.poll(Maintain::Wait);

        match pollster::block_on(r.receive()) {
            Some(Ok(())) => {
                let data = bufslice.get_mapped_range();
                let res = bytemuck::cast_slice(&data).to_vec();
                drop(data);
                recv_buffer.unmap();
                Ok(res)
            }
            Some(Err(err)) => Err(ErrorKind::Device(format!("mapping buffer {}: {err}", self.id)).into()),
            None => Err(ErrorKind::Device(format!("mapping buffer {} was dropped", self.id)).into()),
        }
    }
}

#[derive(Debug)]
struct Kernel {
    pipeline: ComputePipeline,
    layouts: [BindGroupLayout; 3],
}

/// Every pipeline, compiled once when the device is opened.
#[derive(Debug)]
struct Kernels {
    gemm: Kernel,
    col_sum: Kernel,
    relu: Kernel,
    relu_backward: Kernel,
    loss: Kernel,
    scaled_add: Kernel,
    add_row: Kernel,
}

#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C, align(16))]
struct GemmParams {
    m: u32,
    n: u32,
    k: u32,
    flags: u32,
}

#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C, align(16))]
struct MapParams {
    len: u32,
    cols: u32,
    scalar: f32,
    pad: u32,
}

#[derive(Debug)]
pub struct WgpuBackend {
    pub inst: Instance,
    pub adapter: Adapter,
    pub device: Device,
    pub queue: Queue,
    kernels: Kernels,
    target: TargetSlot,
    lastid: BufferId,
}

impl WgpuBackend {
    pub async fn new() -> Result<Self> {
        let inst = Instance::default();

        let adapter = inst
            .request_adapter(&RequestAdapterOptions {
                power_preference: PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| ErrorKind::Device("no suitable adapter".into()))?;
        info!("using adapter {:?}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: None,
                    features: Features::empty(),
                    limits: Limits::downlevel_defaults(),
                },
                None,
            )
            .await
            .map_err(|e| ErrorKind::Device(e.to_string()))?;

        let kernels = Kernels {
            gemm: compile(&device, "gemm", Cow::Borrowed(GEMM), 2),
            col_sum: compile(&device, "col_sum", Cow::Borrowed(COL_SUM), 1),
            relu: map_kernel(&device, "relu", "max(x[i], 0.0)"),
            relu_backward: map_kernel(
                &device,
                "relu_backward",
                "dst[i] + select(0.0, y[i], x[i] > 0.0)",
            ),
            loss: map_kernel(&device, "loss", "y[i] - x[i]"),
            scaled_add: map_kernel(&device, "scaled_add", "dst[i] + params.scalar * x[i]"),
            add_row: map_kernel(&device, "add_row", "dst[i] + x[i % params.cols]"),
        };

        Ok(Self {
            inst,
            adapter,
            device,
            queue,
            kernels,
            target: TargetSlot::default(),
            lastid: 0,
        })
    }

    fn genid(&mut self) -> BufferId {
        self.lastid += 1;
        self.lastid
    }

    fn mk_bind_groups(
        &self,
        [ul, il, ol]: &[BindGroupLayout; 3],
        [ubs, ibs, obs]: [&[&Buffer]; 3],
    ) -> [BindGroup; 3] {
        let mk = |layout: &BindGroupLayout, bufs: &[&Buffer]| {
            let entries = bufs
                .iter()
                .enumerate()
                .map(|(i, v)| BindGroupEntry {
                    binding: i as u32,
                    resource: v.as_entire_binding(),
                })
                .collect::<Vec<_>>();
            self.device.create_bind_group(&BindGroupDescriptor {
                label: None,
                layout,
                entries: &entries,
            })
        };
        [mk(ul, ubs), mk(il, ibs), mk(ol, obs)]
    }

    /// Record and submit one compute pass writing `out`.
    fn dispatch<P: bytemuck::Pod>(
        &self,
        k: &Kernel,
        marker: &str,
        params: &P,
        inputs: &[&Buffer],
        out: &Buffer,
        groups: [usize; 3],
    ) -> Result<()> {
        if groups.iter().any(|g| *g > MAX_GROUPS) {
            return Err(ErrorKind::Device(format!(
                "{marker} needs {groups:?} workgroups, the limit is {MAX_GROUPS}"
            ))
            .into());
        }
        let param_buf = self.device.create_buffer_init(&BufferInitDescriptor {
            label: Some("params"),
            contents: bytemuck::bytes_of(params),
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
        });
        let [ubg, ibg, obg] = self.mk_bind_groups(&k.layouts, [&[&param_buf], inputs, &[out]]);

        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor { label: None });
        {
            let mut cpass = encoder.begin_compute_pass(&ComputePassDescriptor { label: None });
            cpass.set_pipeline(&k.pipeline);
            cpass.set_bind_group(0, &ubg, &[]);
            cpass.set_bind_group(1, &ibg, &[]);
            cpass.set_bind_group(2, &obg, &[]);
            cpass.insert_debug_marker(marker);
            cpass.dispatch_workgroups(groups[0] as u32, groups[1] as u32, groups[2] as u32);
        }
        self.queue.submit(Some(encoder.finish()));
        debug!("dispatched {marker} {groups:?}");
        Ok(())
    }

    fn map(
        &self,
        k: &Kernel,
        marker: &str,
        x: &WgpuBuffer,
        y: &WgpuBuffer,
        out: &WgpuBuffer,
        cols: usize,
        scalar: f32,
    ) -> Result<()> {
        let len = out.shape.len();
        let params = MapParams {
            len: len as u32,
            cols: cols as u32,
            scalar,
            pad: 0,
        };
        self.dispatch(
            k,
            marker,
            &params,
            &[&x.buffer, &y.buffer],
            &out.buffer,
            [(len + 63) / 64, 1, 1],
        )
    }
}

fn mk_ubuf_layout(device: &Device) -> BindGroupLayout {
    device.create_bind_group_layout(&BindGroupLayoutDescriptor {
        label: Label::from("Params"),
        entries: &[wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: wgpu::BufferSize::new(16),
            },
            count: None,
        }],
    })
}

fn mk_sbuf_layout(device: &Device, label: &str, count: u32, read_only: bool) -> BindGroupLayout {
    let entries = (0..count)
        .map(|i| wgpu::BindGroupLayoutEntry {
            binding: i,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: wgpu::BufferSize::new(4),
            },
            count: None,
        })
        .collect::<Vec<_>>();

    device.create_bind_group_layout(&BindGroupLayoutDescriptor {
        label: Label::from(label),
        entries: &entries,
    })
}

fn mk_pipeline_layout(device: &Device, icount: u32) -> (PipelineLayout, [BindGroupLayout; 3]) {
    let uni_layout = mk_ubuf_layout(device);
    let in_layout = mk_sbuf_layout(device, "Inputs", icount, true);
    let out_layout = mk_sbuf_layout(device, "Outputs", 1, false);

    (
        device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: None,
            bind_group_layouts: &[&uni_layout, &in_layout, &out_layout],
            push_constant_ranges: &[],
        }),
        [uni_layout, in_layout, out_layout],
    )
}

fn compile(device: &Device, name: &str, source: Cow<'_, str>, icount: u32) -> Kernel {
    let module = device.create_shader_module(ShaderModuleDescriptor {
        label: Some(name),
        source: ShaderSource::Wgsl(source),
    });
    let (pipeline_layout, layouts) = mk_pipeline_layout(device, icount);
    let pipeline = device.create_compute_pipeline(&ComputePipelineDescriptor {
        label: Some(name),
        layout: Some(&pipeline_layout),
        module: &module,
        entry_point: "main",
    });
    Kernel { pipeline, layouts }
}

/// Elementwise kernel: `dst[i] = expr` over inputs `x` and `y`.
fn map_kernel(device: &Device, name: &str, expr: &str) -> Kernel {
    compile(device, name, Cow::Owned(MAP.replace("__EXPR", expr)), 2)
}

impl Backend for WgpuBackend {
    type Buffer = Rc<WgpuMatrix>;

    fn buffer(&mut self, shape: &Shape) -> Result<Self::Buffer> {
        if shape.is_empty() {
            return mismatch(format!("matrix {shape} has no elements"));
        }
        let buffer = self.device.create_buffer(&BufferDescriptor {
            label: None,
            size: 4 * (shape.len() as u64),
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Ok(Rc::new(WgpuMatrix {
            id: self.genid(),
            shape: *shape,
            buffer,
        }))
    }

    fn zero(&mut self, buf: &Self::Buffer) -> Result<()> {
        let _bind = self.target.bind(buf.id, &[])?;
        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor { label: None });
        encoder.clear_buffer(&buf.buffer, 0, None);
        self.queue.submit(Some(encoder.finish()));
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
        let (m, n, k) = gemm_dims(a.shape, la, b.shape, lb, out.shape)?;
        let _bind = self.target.bind(out.id, &[a.id, b.id])?;
        let flags = la.is_transposed() as u32
            | (lb.is_transposed() as u32) << 1
            | (accumulate as u32) << 2;
        let params = GemmParams {
            m: m as u32,
            n: n as u32,
            k: k as u32,
            flags,
        };
        self.dispatch(
            &self.kernels.gemm,
            "gemm",
            &params,
            &[&a.buffer, &b.buffer],
            &out.buffer,
            [(n + 7) / 8, (m + 7) / 8, 1],
        )
    }

    fn add_row(&mut self, row: &Self::Buffer, out: &Self::Buffer) -> Result<()> {
        if row.shape != Shape::new(out.shape.cols(), 1) {
            return mismatch(format!(
                "row {} cannot be added to every row of {}",
                row.shape, out.shape
            ));
        }
        let _bind = self.target.bind(out.id, &[row.id])?;
        self.map(&self.kernels.add_row, "add_row", row, row, out, out.shape.cols(), 0.0)
    }

    fn col_sum(&mut self, x: &Self::Buffer, out: &Self::Buffer) -> Result<()> {
        if out.shape != Shape::new(x.shape.cols(), 1) {
            return mismatch(format!(
                "column sums of {} do not fit into {}",
                x.shape, out.shape
            ));
        }
        let _bind = self.target.bind(out.id, &[x.id])?;
        let cols = x.shape.cols();
        let params = GemmParams {
            m: x.shape.rows() as u32,
            n: cols as u32,
            k: 0,
            flags: 0,
        };
        self.dispatch(
            &self.kernels.col_sum,
            "col_sum",
            &params,
            &[&x.buffer],
            &out.buffer,
            [(cols + 63) / 64, 1, 1],
        )
    }

    fn relu(&mut self, x: &Self::Buffer, y: &Self::Buffer) -> Result<()> {
        same_shape("relu", x.shape, y.shape)?;
        let _bind = self.target.bind(y.id, &[x.id])?;
        self.map(&self.kernels.relu, "relu", x, x, y, 0, 0.0)
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
        self.map(&self.kernels.relu_backward, "relu_backward", y, dy, dx, 0, 0.0)
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
        self.map(&self.kernels.loss, "loss", expected, actual, dloss, 0, 0.0)
    }

    fn scaled_add(
        &mut self,
        target: &Self::Buffer,
        other: &Self::Buffer,
        scalar: f32,
    ) -> Result<()> {
        same_shape("scaled add", target.shape, other.shape)?;
        let _bind = self.target.bind(target.id, &[other.id])?;
        self.map(&self.kernels.scaled_add, "scaled_add", other, other, target, 0, scalar)
    }

    fn finish(&mut self) -> Result<()> {
        self.device.poll(Maintain::Wait);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn backend() -> Option<WgpuBackend> {
        match pollster::block_on(WgpuBackend::new()) {
            Ok(b) => Some(b),
            Err(e) => {
                eprintln!("skipping wgpu test: {e}");
                None
            }
        }
    }

    fn upload(b: &mut WgpuBackend, w: usize, h: usize, v: &[f32]) -> WgpuBuffer {
        let buf = b.buffer(&Shape::new(w, h)).unwrap();
        buf.write(b, v).unwrap();
        buf
    }

    #[test]
    fn test_kernels_match_reference() {
        let Some(mut b) = backend() else { return };

        let data = [1.0, 2.0, 3.0, 4.0];
        let a = upload(&mut b, 2, 2, &data);
        assert_eq!(a.read(&mut b).unwrap(), data);

        let c = upload(&mut b, 1, 2, &[5.0, 6.0]);
        let out = b.buffer(&Shape::new(1, 2)).unwrap();
        b.gemm(&a, Layout::Normal, &c, Layout::Normal, &out, false).unwrap();
        assert_eq!(out.read(&mut b).unwrap(), [17.0, 39.0]);
        b.gemm(&a, Layout::Transposed, &c, Layout::Normal, &out, true).unwrap();
        assert_eq!(out.read(&mut b).unwrap(), [40.0, 73.0]);

        let bias = upload(&mut b, 2, 1, &[10.0, -20.0]);
        b.add_row(&bias, &a).unwrap();
        assert_eq!(a.read(&mut b).unwrap(), [11.0, -18.0, 13.0, -16.0]);

        let sums = b.buffer(&Shape::new(2, 1)).unwrap();
        b.col_sum(&a, &sums).unwrap();
        assert_eq!(sums.read(&mut b).unwrap(), [24.0, -34.0]);

        let r = b.buffer(&Shape::new(2, 2)).unwrap();
        b.relu(&a, &r).unwrap();
        assert_eq!(r.read(&mut b).unwrap(), [11.0, 0.0, 13.0, 0.0]);

        let dy = upload(&mut b, 2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let dx = b.buffer(&Shape::new(2, 2)).unwrap();
        b.relu_backward(&r, &dy, &dx).unwrap();
        assert_eq!(dx.read(&mut b).unwrap(), [1.0, 0.0, 1.0, 0.0]);
        // Accumulates into the existing gradient
        b.relu_backward(&r, &dy, &dx).unwrap();
        assert_eq!(dx.read(&mut b).unwrap(), [2.0, 0.0, 2.0, 0.0]);

        let expected = upload(&mut b, 2, 2, &data);
        let actual = upload(&mut b, 2, 2, &[0.0, 4.0, 3.0, 1.0]);
        let dloss = b.buffer(&Shape::new(2, 2)).unwrap();
        b.loss(&expected, &actual, &dloss).unwrap();
        assert_eq!(dloss.read(&mut b).unwrap(), [-1.0, 2.0, 0.0, -3.0]);
        // Overwrites rather than accumulates
        b.loss(&expected, &actual, &dloss).unwrap();
        assert_eq!(dloss.read(&mut b).unwrap(), [-1.0, 2.0, 0.0, -3.0]);

        r.scaled_add(&mut b, &a, -1.0).unwrap();
        assert_eq!(r.read(&mut b).unwrap(), [0.0, 18.0, 0.0, 16.0]);

        b.zero(&r).unwrap();
        b.finish().unwrap();
        assert_eq!(r.read(&mut b).unwrap(), [0.0; 4]);
    }
}
