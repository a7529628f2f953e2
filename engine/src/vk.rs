// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The shape of the Vulkan backend, as seen by the render graph.
//!
//! The actual backend (device, pipelines, allocator) lives outside the
//! engine core; the graph only needs handles to refer to its objects, the
//! mask types barriers are built from and the [`CommandBuffer`] recording
//! surface. Nothing here talks to a driver.

use bitflags::bitflags;

bitflags! {
    /// Pipeline stages, for barrier scopes and timestamps.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct StageFlags: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const VERTEX_INPUT = 1 << 1;
        const VERTEX_SHADER = 1 << 2;
        const FRAGMENT_SHADER = 1 << 3;
        const EARLY_FRAGMENT_TESTS = 1 << 4;
        const LATE_FRAGMENT_TESTS = 1 << 5;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 6;
        const COMPUTE_SHADER = 1 << 7;
        const TRANSFER = 1 << 8;
        const BOTTOM_OF_PIPE = 1 << 9;
        const ALL_COMMANDS = 1 << 10;
    }
}

bitflags! {
    /// Memory access kinds, for barrier scopes.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct AccessFlags: u32 {
        const INDEX_READ = 1 << 0;
        const VERTEX_ATTRIBUTE_READ = 1 << 1;
        const UNIFORM_READ = 1 << 2;
        const SHADER_READ = 1 << 3;
        const SHADER_WRITE = 1 << 4;
        const COLOR_ATTACHMENT_READ = 1 << 5;
        const COLOR_ATTACHMENT_WRITE = 1 << 6;
        const DEPTH_STENCIL_READ = 1 << 7;
        const DEPTH_STENCIL_WRITE = 1 << 8;
        const TRANSFER_READ = 1 << 9;
        const TRANSFER_WRITE = 1 << 10;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct ImageUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const COLOR_ATTACHMENT = 1 << 2;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct BufferUsage: u32 {
        const UNIFORM = 1 << 0;
        const STORAGE = 1 << 1;
        const INDEX = 1 << 2;
        const VERTEX = 1 << 3;
        const INDIRECT = 1 << 4;
        const TRANSFER_SRC = 1 << 5;
        const TRANSFER_DST = 1 << 6;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ImageLayout {
    #[default]
    Undefined,
    General,
    ColorAttachment,
    DepthStencilAttachment,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    PresentSrc,
}

/// The handful of formats the core cares about; the backend owns the full
/// format zoo.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Rgba8Unorm,
    Bgra8Srgb,
    Rgba16Float,
    D32Float,
}

impl Format {
    pub fn is_depth(self) -> bool {
        matches!(self, Format::D32Float)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Extent2d {
    pub width: u32,
    pub height: u32,
}

impl Extent2d {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

// Opaque backend object handles.
macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub u64);
    };
}

handle!(BufferHandle);
handle!(ImageHandle);
handle!(PipelineHandle);
handle!(DescriptorSetHandle);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: BufferHandle,
    pub src_stage: StageFlags,
    pub src_access: AccessFlags,
    pub dst_stage: StageFlags,
    pub dst_access: AccessFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: ImageHandle,
    pub src_stage: StageFlags,
    pub src_access: AccessFlags,
    pub dst_stage: StageFlags,
    pub dst_access: AccessFlags,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
}

#[derive(Clone, Copy, Debug)]
pub struct RenderingAttachment {
    pub image: ImageHandle,
    pub layout: ImageLayout,
}

#[derive(Clone, Debug, Default)]
pub struct RenderingInfo {
    pub extent: Extent2d,
    pub color_attachments: Vec<RenderingAttachment>,
    pub depth_attachment: Option<RenderingAttachment>,
}

/// The command recording surface the graph drives.
///
/// The engine's Vulkan backend implements this over a real command buffer;
/// tests implement it with a recorder.
pub trait CommandBuffer {
    fn begin(&mut self);
    fn end(&mut self);

    fn pipeline_barrier(&mut self, buffers: &[BufferBarrier], images: &[ImageBarrier]);
    fn begin_rendering(&mut self, info: &RenderingInfo);
    fn end_rendering(&mut self);

    fn bind_pipeline(&mut self, pipeline: PipelineHandle);
    fn bind_descriptor_set(&mut self, index: u32, set: DescriptorSetHandle);
    fn bind_vertex_buffer(&mut self, buffer: BufferHandle);
    fn bind_index_buffer(&mut self, buffer: BufferHandle);

    fn draw(&mut self, vertex_count: u32, instance_count: u32);
    fn draw_indexed(&mut self, index_count: u32, first_index: u32);
    fn dispatch(&mut self, x: u32, y: u32, z: u32);
    fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle, size: u64);

    fn write_timestamp(&mut self, stage: StageFlags, query: u32);
}

/// Creates backing objects for the graph's transient resources.
///
/// The graph hands over the resource description plus its computed
/// lifetime; a pooled implementation may alias memory between resources
/// whose lifetimes do not overlap, a simple one allocates per resource.
pub trait ResourceAllocator {
    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> BufferHandle;
    fn create_image(&mut self, extent: Extent2d, format: Format, usage: ImageUsage)
    -> ImageHandle;
}

/// Timestamp query storage the graph brackets passes with when profiling
/// is enabled.
pub trait TimestampPool {
    /// Makes room for `count` queries and invalidates old results.
    fn reset(&mut self, count: u32);
    /// The recorded tick values, index-aligned with the written queries.
    fn resolve(&self) -> Vec<u64>;
    /// Nanoseconds per tick.
    fn period_ns(&self) -> f64;
}
