// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The render graph: a declarative DAG of passes over named resources,
//! compiled each frame into an ordered plan with synchronization.
//!
//! Declaration is cheap and order-tolerant: mint resource ids, declare
//! passes with their read/write sets, then [`RenderGraph::compile`]
//! towards the frame's target resource. Compilation prunes passes that do
//! not contribute to the target, orders the survivors and derives the
//! pipeline barriers and image layout transitions between them;
//! [`RenderGraph::execute`] replays the plan onto a command buffer.

mod compile;

pub use compile::{Barrier, CompiledPlan, Lifetime};

use crate::vk;
use core::fmt;
use std::collections::HashMap;

/// Handle to a resource declared on a [`RenderGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceId(pub(crate) u32);

/// What a logical resource is, and how passes may use it.
#[derive(Clone, Debug)]
pub enum ResourceKind {
    Buffer {
        size: u64,
        usage: vk::BufferUsage,
    },
    Image {
        extent: vk::Extent2d,
        format: vk::Format,
        usage: vk::ImageUsage,
    },
    /// The presentation target; always imported, transitions to
    /// `PresentSrc` at the end of the plan.
    Swapchain {
        extent: vk::Extent2d,
        format: vk::Format,
    },
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Backing {
    Buffer(vk::BufferHandle),
    Image(vk::ImageHandle),
}

pub(crate) struct Resource {
    pub(crate) name: String,
    pub(crate) kind: ResourceKind,
    /// Externally owned backing; transient resources have none until
    /// execution allocates one.
    pub(crate) import: Option<Backing>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassKind {
    Graphics,
    Compute,
    Transfer,
}

type ExecuteFn = Box<dyn FnMut(&mut dyn vk::CommandBuffer)>;

pub(crate) struct Pass {
    pub(crate) name: String,
    pub(crate) kind: PassKind,
    pub(crate) reads: Vec<ResourceId>,
    pub(crate) writes: Vec<ResourceId>,
    /// A pass without a callback is a synchronization point only.
    pub(crate) execute: Option<ExecuteFn>,
}

/// Errors reported by [`RenderGraph::compile`].
#[derive(Debug)]
pub enum RenderGraphError {
    /// The target handle does not belong to this graph.
    UnknownResource,
    /// The named passes depend on each other in a loop.
    CycleDetected(Vec<String>),
    /// The graph cannot produce the requested target.
    CompileInconsistent(String),
}

impl fmt::Display for RenderGraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderGraphError::UnknownResource => f.write_str("unknown resource handle"),
            RenderGraphError::CycleDetected(passes) => {
                write!(f, "dependency cycle between passes: {}", passes.join(", "))
            }
            RenderGraphError::CompileInconsistent(what) => {
                write!(f, "inconsistent graph: {what}")
            }
        }
    }
}

impl core::error::Error for RenderGraphError {}

/// See the module documentation.
#[derive(Default)]
pub struct RenderGraph {
    pub(crate) resources: Vec<Resource>,
    pub(crate) passes: Vec<Pass>,
    timestamps: Option<Box<dyn vk::TimestampPool>>,
    pass_times: HashMap<String, f64>,
}

impl RenderGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_resource(&mut self, resource: Resource) -> ResourceId {
        let id = u32::try_from(self.resources.len()).expect("too many resources");
        self.resources.push(resource);
        ResourceId(id)
    }

    /// Declares a transient resource; its backing lives only for the span
    /// of one compiled plan.
    pub fn new_attachment(&mut self, name: impl Into<String>, kind: ResourceKind) -> ResourceId {
        self.push_resource(Resource {
            name: name.into(),
            kind,
            import: None,
        })
    }

    /// Imports an externally owned image (e.g. a streamed texture).
    pub fn import_image(
        &mut self,
        name: impl Into<String>,
        handle: vk::ImageHandle,
        extent: vk::Extent2d,
        format: vk::Format,
        usage: vk::ImageUsage,
    ) -> ResourceId {
        self.push_resource(Resource {
            name: name.into(),
            kind: ResourceKind::Image {
                extent,
                format,
                usage,
            },
            import: Some(Backing::Image(handle)),
        })
    }

    /// Imports an externally owned buffer.
    pub fn import_buffer(
        &mut self,
        name: impl Into<String>,
        handle: vk::BufferHandle,
        size: u64,
        usage: vk::BufferUsage,
    ) -> ResourceId {
        self.push_resource(Resource {
            name: name.into(),
            kind: ResourceKind::Buffer { size, usage },
            import: Some(Backing::Buffer(handle)),
        })
    }

    /// Imports this frame's swapchain image as the presentation target.
    pub fn import_swapchain(
        &mut self,
        name: impl Into<String>,
        handle: vk::ImageHandle,
        extent: vk::Extent2d,
        format: vk::Format,
    ) -> ResourceId {
        self.push_resource(Resource {
            name: name.into(),
            kind: ResourceKind::Swapchain { extent, format },
            import: Some(Backing::Image(handle)),
        })
    }

    /// Starts declaring a pass; finish by dropping the returned builder.
    pub fn add_pass(&mut self, name: impl Into<String>, kind: PassKind) -> PassBuilder<'_> {
        let index = self.passes.len();
        self.passes.push(Pass {
            name: name.into(),
            kind,
            reads: Vec::new(),
            writes: Vec::new(),
            execute: None,
        });
        PassBuilder { graph: self, index }
    }

    pub fn resource_name(&self, id: ResourceId) -> &str {
        &self.resources[id.0 as usize].name
    }

    /// Installs a timestamp pool; compiled plans are then bracketed with
    /// per-pass timestamp queries and [`RenderGraph::pass_times`] is
    /// filled in by [`RenderGraph::collect_pass_times`].
    pub fn enable_timestamps(&mut self, pool: Box<dyn vk::TimestampPool>) {
        self.timestamps = Some(pool);
    }

    pub(crate) fn timestamps_mut(&mut self) -> Option<&mut Box<dyn vk::TimestampPool>> {
        self.timestamps.as_mut()
    }

    pub(crate) fn record_pass_time(&mut self, pass: &str, milliseconds: f64) {
        self.pass_times.insert(pass.to_owned(), milliseconds);
    }

    /// Per-pass GPU times in milliseconds from the most recent
    /// [`RenderGraph::collect_pass_times`].
    pub fn pass_times(&self) -> &HashMap<String, f64> {
        &self.pass_times
    }

    fn check_id(&self, id: ResourceId) {
        assert!(
            (id.0 as usize) < self.resources.len(),
            "unknown resource handle {id:?}"
        );
    }
}

impl fmt::Debug for RenderGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderGraph")
            .field("resources", &self.resources.len())
            .field("passes", &self.passes.len())
            .finish()
    }
}

/// Declares the read/write sets and the execute callback of one pass.
pub struct PassBuilder<'g> {
    graph: &'g mut RenderGraph,
    index: usize,
}

impl PassBuilder<'_> {
    fn pass(&mut self) -> &mut Pass {
        &mut self.graph.passes[self.index]
    }

    /// Declares that the pass reads `resource`.
    ///
    /// # Panics
    ///
    /// Panics on an unknown handle or if the pass already writes the
    /// resource; a pass never both reads and writes the same resource.
    #[must_use]
    pub fn read(mut self, resource: ResourceId) -> Self {
        self.graph.check_id(resource);
        let pass = self.pass();
        assert!(
            !pass.writes.contains(&resource),
            "pass {} both reads and writes {resource:?}",
            pass.name
        );
        if !pass.reads.contains(&resource) {
            pass.reads.push(resource);
        }
        self
    }

    /// Declares that the pass writes `resource`.
    ///
    /// # Panics
    ///
    /// Panics on an unknown handle or if the pass already reads the
    /// resource.
    #[must_use]
    pub fn write(mut self, resource: ResourceId) -> Self {
        self.graph.check_id(resource);
        let pass = self.pass();
        assert!(
            !pass.reads.contains(&resource),
            "pass {} both reads and writes {resource:?}",
            pass.name
        );
        if !pass.writes.contains(&resource) {
            pass.writes.push(resource);
        }
        self
    }

    /// Installs the recording callback. A pass without one still
    /// participates in ordering and synchronization.
    #[must_use]
    pub fn set_on_execute(
        mut self,
        callback: impl FnMut(&mut dyn vk::CommandBuffer) + 'static,
    ) -> Self {
        self.pass().execute = Some(Box::new(callback));
        self
    }
}
