//! GPU buffer management for particle data.
//!
//! `MirroredBuffer` pairs a host `Vec<Vec4>` with a wgpu storage buffer and
//! tracks which side holds the newer data. Transfers are always explicit:
//! `to_device` / `to_host` reconcile the sides and are no-ops when already
//! clean. Reading the host side while the device side is newer is a
//! programming error and panics.

use wgpu;
use wgpu::util::DeviceExt;

use crate::particle::Vec4;

/// Bytes per packed particle record.
const VEC4_SIZE: u64 = std::mem::size_of::<Vec4>() as u64;

/// Minimum buffer size (wgpu requires non-zero buffers).
const MIN_BUF_SIZE: u64 = VEC4_SIZE;

fn create_storage_buf(device: &wgpu::Device, label: &str, data: &[Vec4], capacity: usize) -> wgpu::Buffer {
    if data.is_empty() {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: ((capacity as u64) * VEC4_SIZE).max(MIN_BUF_SIZE),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    } else {
        device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(data),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
        })
    }
}

fn create_staging_buf(device: &wgpu::Device, label: &str, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: size.max(MIN_BUF_SIZE),
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Block on mapping a staging buffer and read `count` packed records.
pub fn read_vec4_buffer(device: &wgpu::Device, buffer: &wgpu::Buffer, count: usize) -> Vec<Vec4> {
    let slice = buffer.slice(..(count as u64 * VEC4_SIZE).max(MIN_BUF_SIZE));
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        tx.send(result).unwrap();
    });
    device.poll(wgpu::Maintain::Wait);
    rx.recv().unwrap().unwrap();

    let data = slice.get_mapped_range();
    let result: Vec<Vec4> = bytemuck::cast_slice(&data)[..count].to_vec();
    drop(data);
    buffer.unmap();
    result
}

/// One logical particle array mirrored between host and device.
pub struct MirroredBuffer {
    label: &'static str,
    host: Vec<Vec4>,
    device_buf: wgpu::Buffer,
    staging_buf: wgpu::Buffer,
    /// Device-side capacity in records (may exceed the host length).
    capacity: usize,
    /// Number of valid records on the device side.
    device_len: usize,
    /// Host side has writes the device has not seen.
    host_dirty: bool,
    /// Device side has writes the host has not seen.
    device_dirty: bool,
}

impl MirroredBuffer {
    /// Create a mirrored array from initial host contents; the device copy
    /// starts synchronized.
    pub fn new(device: &wgpu::Device, label: &'static str, host: Vec<Vec4>) -> Self {
        let capacity = host.len().max(1);
        let device_buf = create_storage_buf(device, label, &host, capacity);
        let staging_buf = create_staging_buf(device, label, (capacity as u64) * VEC4_SIZE);
        let device_len = host.len();
        Self {
            label,
            host,
            device_buf,
            staging_buf,
            capacity,
            device_len,
            host_dirty: false,
            device_dirty: false,
        }
    }

    /// Number of records on the authoritative side.
    pub fn len(&self) -> usize {
        if self.device_dirty {
            self.device_len
        } else {
            self.host.len()
        }
    }

    /// True when no records are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Device-side capacity in records.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The underlying device buffer, for bind groups and copies.
    pub fn raw(&self) -> &wgpu::Buffer {
        &self.device_buf
    }

    /// Read the host side. Panics if the device side is newer; call
    /// `to_host` first.
    pub fn host(&self) -> &[Vec4] {
        assert!(
            !self.device_dirty,
            "{}: host read while device copy is newer",
            self.label
        );
        &self.host
    }

    /// Mutate the host side, marking it dirty. Panics if the device side is
    /// newer.
    pub fn host_mut(&mut self) -> &mut Vec<Vec4> {
        assert!(
            !self.device_dirty,
            "{}: host write while device copy is newer",
            self.label
        );
        self.host_dirty = true;
        &mut self.host
    }

    /// Mark the device side as written by a compute pass or copy.
    pub fn mark_device_written(&mut self, len: usize) {
        assert!(len <= self.capacity, "{}: device write past capacity", self.label);
        self.device_len = len;
        self.device_dirty = true;
    }

    /// Ensure the device side can hold `n` records, reallocating (and
    /// re-uploading any clean host contents) when it cannot. Reallocation
    /// invalidates derived device data.
    pub fn ensure_capacity(&mut self, device: &wgpu::Device, n: usize) {
        if n <= self.capacity {
            return;
        }
        assert!(
            !self.device_dirty,
            "{}: reallocation would drop unreconciled device data",
            self.label
        );
        let capacity = n.next_power_of_two();
        self.device_buf = create_storage_buf(device, self.label, &[], capacity);
        self.staging_buf = create_staging_buf(device, self.label, (capacity as u64) * VEC4_SIZE);
        self.capacity = capacity;
        self.host_dirty = !self.host.is_empty();
    }

    /// Push pending host writes to the device. Idempotent when clean.
    pub fn to_device(&mut self, device: &wgpu::Device, queue: &wgpu::Queue) {
        if !self.host_dirty {
            return;
        }
        self.ensure_capacity(device, self.host.len());
        if !self.host.is_empty() {
            queue.write_buffer(&self.device_buf, 0, bytemuck::cast_slice(&self.host));
        }
        self.device_len = self.host.len();
        self.host_dirty = false;
    }

    /// Pull pending device writes back to the host. Idempotent when clean.
    pub fn to_host(&mut self, device: &wgpu::Device, queue: &wgpu::Queue) {
        if !self.device_dirty {
            return;
        }
        let n = self.device_len;
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(self.label),
        });
        encoder.copy_buffer_to_buffer(
            &self.device_buf,
            0,
            &self.staging_buf,
            0,
            ((n as u64) * VEC4_SIZE).max(MIN_BUF_SIZE),
        );
        queue.submit(std::iter::once(encoder.finish()));
        self.host = read_vec4_buffer(device, &self.staging_buf, n);
        self.device_dirty = false;
        self.host_dirty = false;
    }

    /// Abandon unreconciled device writes, restoring host authority. Used
    /// when the device-side tail was scratch (e.g. an appended import block
    /// that is not wanted back).
    pub fn discard_device(&mut self) {
        self.device_dirty = false;
        self.device_len = self.host.len();
    }

    /// Device-to-device append: copy `count` records from the front of
    /// `src`'s device buffer to offset `at_offset` in this buffer, without a
    /// host round trip. Used to merge a secondary population (dust, imports)
    /// into the primary buffer. The caller must have reserved capacity.
    pub fn copy_from_device(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        src: &MirroredBuffer,
        count: usize,
        at_offset: usize,
    ) {
        assert!(
            at_offset + count <= self.capacity,
            "{}: append of {} records at {} exceeds capacity {}",
            self.label,
            count,
            at_offset,
            self.capacity
        );
        if count == 0 {
            return;
        }
        encoder.copy_buffer_to_buffer(
            &src.device_buf,
            0,
            &self.device_buf,
            (at_offset as u64) * VEC4_SIZE,
            (count as u64) * VEC4_SIZE,
        );
        self.device_len = self.device_len.max(at_offset + count);
        self.device_dirty = true;
    }
}
