// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{Backing, PassKind, RenderGraph, RenderGraphError, ResourceId, ResourceKind};
use crate::vk;
use std::collections::BTreeSet;

/// One synchronization entry of a compiled plan, still in terms of graph
/// resources; execution lowers it to a buffer or image barrier against the
/// resource's backing.
#[derive(Clone, Copy, Debug)]
pub struct Barrier {
    pub resource: ResourceId,
    pub src_stage: vk::StageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stage: vk::StageFlags,
    pub dst_access: vk::AccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
}

/// First and last use of a transient resource, as positions in the plan's
/// pass order. An allocator may alias the backing memory of resources
/// whose lifetimes do not overlap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lifetime {
    pub first_use: usize,
    pub last_use: usize,
}

/// The result of [`RenderGraph::compile`]: an ordered pass list plus the
/// synchronization to splice between the passes.
pub struct CompiledPlan {
    /// Indices into the graph's pass list, in execution order.
    pub(crate) pass_order: Vec<usize>,
    /// Pass names in execution order.
    names: Vec<String>,
    /// `barriers[i]` are issued immediately before `pass_order[i]`.
    barriers: Vec<Vec<Barrier>>,
    /// Issued after the last pass (the present transition).
    final_barriers: Vec<Barrier>,
    /// Indexed by resource; `None` for unused or imported resources.
    lifetimes: Vec<Option<Lifetime>>,
}

impl CompiledPlan {
    /// Pass names in execution order.
    pub fn passes(&self) -> &[String] {
        &self.names
    }

    /// The barriers issued right before the pass at `position`.
    pub fn barriers_before(&self, position: usize) -> &[Barrier] {
        &self.barriers[position]
    }

    pub fn final_barriers(&self) -> &[Barrier] {
        &self.final_barriers
    }

    pub fn lifetime(&self, resource: ResourceId) -> Option<Lifetime> {
        self.lifetimes[resource.0 as usize]
    }
}

/// How a pass of a given kind touches a resource of a given kind.
fn access_for(
    pass: PassKind,
    resource: &ResourceKind,
    write: bool,
) -> (vk::StageFlags, vk::AccessFlags, vk::ImageLayout) {
    use vk::{AccessFlags as A, ImageLayout as L, StageFlags as S};

    match pass {
        PassKind::Transfer => {
            if write {
                let layout = match resource {
                    ResourceKind::Buffer { .. } => L::Undefined,
                    _ => L::TransferDst,
                };
                (S::TRANSFER, A::TRANSFER_WRITE, layout)
            } else {
                let layout = match resource {
                    ResourceKind::Buffer { .. } => L::Undefined,
                    _ => L::TransferSrc,
                };
                (S::TRANSFER, A::TRANSFER_READ, layout)
            }
        }
        PassKind::Compute => match resource {
            ResourceKind::Buffer { usage, .. } => {
                if write {
                    (S::COMPUTE_SHADER, A::SHADER_WRITE, L::Undefined)
                } else if usage.contains(vk::BufferUsage::UNIFORM) {
                    (S::COMPUTE_SHADER, A::UNIFORM_READ, L::Undefined)
                } else {
                    (S::COMPUTE_SHADER, A::SHADER_READ, L::Undefined)
                }
            }
            ResourceKind::Image { usage, .. } => {
                if write {
                    (S::COMPUTE_SHADER, A::SHADER_WRITE, L::General)
                } else if usage.contains(vk::ImageUsage::STORAGE) {
                    (S::COMPUTE_SHADER, A::SHADER_READ, L::General)
                } else {
                    (S::COMPUTE_SHADER, A::SHADER_READ, L::ShaderReadOnly)
                }
            }
            ResourceKind::Swapchain { .. } => {
                (S::COMPUTE_SHADER, A::SHADER_WRITE, L::General)
            }
        },
        PassKind::Graphics => match resource {
            ResourceKind::Buffer { usage, .. } => {
                if write {
                    (S::FRAGMENT_SHADER, A::SHADER_WRITE, L::Undefined)
                } else if usage.contains(vk::BufferUsage::INDEX) {
                    (S::VERTEX_INPUT, A::INDEX_READ, L::Undefined)
                } else if usage.contains(vk::BufferUsage::VERTEX) {
                    (S::VERTEX_INPUT, A::VERTEX_ATTRIBUTE_READ, L::Undefined)
                } else if usage.contains(vk::BufferUsage::UNIFORM) {
                    (
                        S::VERTEX_SHADER | S::FRAGMENT_SHADER,
                        A::UNIFORM_READ,
                        L::Undefined,
                    )
                } else {
                    (S::FRAGMENT_SHADER, A::SHADER_READ, L::Undefined)
                }
            }
            ResourceKind::Image { format, usage, .. } => {
                let depth = format.is_depth()
                    || usage.contains(vk::ImageUsage::DEPTH_STENCIL_ATTACHMENT);
                if write && depth {
                    (
                        S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
                        A::DEPTH_STENCIL_WRITE,
                        L::DepthStencilAttachment,
                    )
                } else if write {
                    (
                        S::COLOR_ATTACHMENT_OUTPUT,
                        A::COLOR_ATTACHMENT_WRITE,
                        L::ColorAttachment,
                    )
                } else {
                    (S::FRAGMENT_SHADER, A::SHADER_READ, L::ShaderReadOnly)
                }
            }
            ResourceKind::Swapchain { .. } => (
                S::COLOR_ATTACHMENT_OUTPUT,
                A::COLOR_ATTACHMENT_WRITE,
                L::ColorAttachment,
            ),
        },
    }
}

#[derive(Clone, Copy)]
struct ResourceUse {
    position: usize,
    stage: vk::StageFlags,
    access: vk::AccessFlags,
    layout: vk::ImageLayout,
    write: bool,
}

impl RenderGraph {
    /// Compiles the graph towards `target`: prunes passes that do not
    /// contribute to it, orders the survivors (declaration order breaks
    /// ties) and derives barriers and transient lifetimes.
    ///
    /// # Errors
    ///
    /// `UnknownResource` for a foreign target handle, `CompileInconsistent`
    /// if nothing writes the target, `CycleDetected` if the surviving
    /// passes depend on each other circularly.
    pub fn compile(&self, target: ResourceId) -> Result<CompiledPlan, RenderGraphError> {
        let target_index = target.0 as usize;
        if target_index >= self.resources.len() {
            return Err(RenderGraphError::UnknownResource);
        }

        let pass_count = self.passes.len();

        // Writers per resource, in declaration order.
        let mut writers: Vec<Vec<usize>> = vec![Vec::new(); self.resources.len()];
        for (index, pass) in self.passes.iter().enumerate() {
            for write in &pass.writes {
                writers[write.0 as usize].push(index);
            }
        }

        // Dependencies: a reader depends on the resource's most recent
        // writer (falling back to its last writer when every write is
        // declared later), and writers chain on the previous writer.
        let mut deps: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); pass_count];
        for (index, pass) in self.passes.iter().enumerate() {
            for read in &pass.reads {
                let resource_writers = &writers[read.0 as usize];
                let dep = resource_writers
                    .iter()
                    .rev()
                    .find(|&&writer| writer < index)
                    .or(resource_writers.last());
                if let Some(&writer) = dep
                    && writer != index
                {
                    deps[index].insert(writer);
                }
            }
            for write in &pass.writes {
                if let Some(&previous) = writers[write.0 as usize]
                    .iter()
                    .rev()
                    .find(|&&writer| writer < index)
                {
                    deps[index].insert(previous);
                }
            }
        }

        // Prune everything not transitively feeding the target's last
        // writer.
        let root = *writers[target_index].last().ok_or_else(|| {
            RenderGraphError::CompileInconsistent(format!(
                "no pass writes the target resource '{}'",
                self.resources[target_index].name
            ))
        })?;

        let mut keep = vec![false; pass_count];
        let mut stack = vec![root];
        while let Some(index) = stack.pop() {
            if core::mem::replace(&mut keep[index], true) {
                continue;
            }
            stack.extend(deps[index].iter().copied());
        }
        let kept = keep.iter().filter(|&&kept| kept).count();
        tracing::trace!(kept, total = pass_count, "pruned render graph");

        // Stable topological order: among ready passes, lowest declaration
        // index first.
        let mut order = Vec::with_capacity(kept);
        let mut placed = vec![false; pass_count];
        loop {
            let next = (0..pass_count).find(|&index| {
                keep[index]
                    && !placed[index]
                    && deps[index]
                        .iter()
                        .all(|&dep| !keep[dep] || placed[dep])
            });
            let Some(index) = next else { break };
            placed[index] = true;
            order.push(index);
        }
        if order.len() != kept {
            let stuck = (0..pass_count)
                .filter(|&index| keep[index] && !placed[index])
                .map(|index| self.passes[index].name.clone())
                .collect();
            return Err(RenderGraphError::CycleDetected(stuck));
        }

        // Use sequences per resource, in plan order.
        let mut uses: Vec<Vec<ResourceUse>> = vec![Vec::new(); self.resources.len()];
        for (position, &pass_index) in order.iter().enumerate() {
            let pass = &self.passes[pass_index];
            for (list, write) in [(&pass.reads, false), (&pass.writes, true)] {
                for resource in list {
                    let (stage, access, layout) =
                        access_for(pass.kind, &self.resources[resource.0 as usize].kind, write);
                    uses[resource.0 as usize].push(ResourceUse {
                        position,
                        stage,
                        access,
                        layout,
                        write,
                    });
                }
            }
        }

        // Barriers between consecutive uses that differ, plus the initial
        // layout transition for images.
        let mut barriers: Vec<Vec<Barrier>> = vec![Vec::new(); order.len()];
        let mut final_barriers = Vec::new();
        let mut lifetimes: Vec<Option<Lifetime>> = vec![None; self.resources.len()];

        for (resource_index, resource_uses) in uses.iter().enumerate() {
            let resource = &self.resources[resource_index];
            let id = ResourceId(u32::try_from(resource_index).expect("resource count fits u32"));
            let is_image = !matches!(resource.kind, ResourceKind::Buffer { .. });

            // Imported images arrive in whatever layout their owner left
            // them in; only transients and the freshly acquired swapchain
            // image need the initial transition out of Undefined.
            let needs_initial_transition = resource.import.is_none()
                || matches!(resource.kind, ResourceKind::Swapchain { .. });

            let mut previous: Option<ResourceUse> = None;
            for current in resource_uses {
                match previous {
                    None => {
                        if is_image
                            && needs_initial_transition
                            && current.layout != vk::ImageLayout::Undefined
                        {
                            barriers[current.position].push(Barrier {
                                resource: id,
                                src_stage: vk::StageFlags::TOP_OF_PIPE,
                                src_access: vk::AccessFlags::empty(),
                                dst_stage: current.stage,
                                dst_access: current.access,
                                old_layout: vk::ImageLayout::Undefined,
                                new_layout: current.layout,
                            });
                        }
                    }
                    Some(previous) => {
                        let hazard = previous.write || current.write;
                        if hazard
                            || previous.access != current.access
                            || previous.layout != current.layout
                        {
                            barriers[current.position].push(Barrier {
                                resource: id,
                                src_stage: previous.stage,
                                src_access: previous.access,
                                dst_stage: current.stage,
                                dst_access: current.access,
                                old_layout: previous.layout,
                                new_layout: current.layout,
                            });
                        }
                    }
                }
                previous = Some(*current);
            }

            if let (Some(first), Some(last)) = (resource_uses.first(), resource_uses.last()) {
                if resource.import.is_none() {
                    lifetimes[resource_index] = Some(Lifetime {
                        first_use: first.position,
                        last_use: last.position,
                    });
                }
                // The presentation target leaves the graph in PresentSrc.
                if matches!(resource.kind, ResourceKind::Swapchain { .. }) {
                    final_barriers.push(Barrier {
                        resource: id,
                        src_stage: last.stage,
                        src_access: last.access,
                        dst_stage: vk::StageFlags::BOTTOM_OF_PIPE,
                        dst_access: vk::AccessFlags::empty(),
                        old_layout: last.layout,
                        new_layout: vk::ImageLayout::PresentSrc,
                    });
                }
            }
        }

        let names = order
            .iter()
            .map(|&index| self.passes[index].name.clone())
            .collect();

        Ok(CompiledPlan {
            pass_order: order,
            names,
            barriers,
            final_barriers,
            lifetimes,
        })
    }

    /// Replays a compiled plan onto a command buffer: allocates transient
    /// backings, splices barriers between the passes, brackets graphics
    /// passes with rendering begin/end and invokes the pass callbacks.
    pub fn execute(
        &mut self,
        plan: &CompiledPlan,
        allocator: &mut dyn vk::ResourceAllocator,
        cmd: &mut dyn vk::CommandBuffer,
    ) {
        // Back every live transient resource. Dedicated allocations; the
        // lifetimes in the plan let a pooled allocator do better.
        let mut backings: Vec<Option<Backing>> =
            self.resources.iter().map(|resource| resource.import).collect();
        for (index, backing) in backings.iter_mut().enumerate() {
            if backing.is_some() || plan.lifetimes[index].is_none() {
                continue;
            }
            *backing = Some(match &self.resources[index].kind {
                ResourceKind::Buffer { size, usage } => {
                    Backing::Buffer(allocator.create_buffer(*size, *usage))
                }
                ResourceKind::Image {
                    extent,
                    format,
                    usage,
                } => Backing::Image(allocator.create_image(*extent, *format, *usage)),
                ResourceKind::Swapchain { .. } => {
                    unreachable!("swapchain resources are always imported")
                }
            });
        }

        let timestamps_enabled = if let Some(pool) = self.timestamps_mut() {
            pool.reset(u32::try_from(2 * plan.pass_order.len()).expect("query count fits u32"));
            true
        } else {
            false
        };

        cmd.begin();

        for (position, &pass_index) in plan.pass_order.iter().enumerate() {
            emit_barriers(&plan.barriers[position], &backings, cmd);

            if timestamps_enabled {
                cmd.write_timestamp(
                    vk::StageFlags::TOP_OF_PIPE,
                    u32::try_from(2 * position).expect("query index fits u32"),
                );
            }

            let rendering = self.rendering_info(pass_index, &backings);
            if let Some(info) = &rendering {
                cmd.begin_rendering(info);
            }

            let pass = &mut self.passes[pass_index];
            tracing::trace!(pass = %pass.name, "executing pass");
            if let Some(execute) = &mut pass.execute {
                execute(cmd);
            }

            if rendering.is_some() {
                cmd.end_rendering();
            }

            if timestamps_enabled {
                cmd.write_timestamp(
                    vk::StageFlags::BOTTOM_OF_PIPE,
                    u32::try_from(2 * position + 1).expect("query index fits u32"),
                );
            }
        }

        emit_barriers(&plan.final_barriers, &backings, cmd);
        cmd.end();
    }

    /// Collects the pass timings of the most recently executed plan into
    /// [`RenderGraph::pass_times`]. No-op unless timestamps are enabled.
    pub fn collect_pass_times(&mut self, plan: &CompiledPlan) {
        let Some(pool) = self.timestamps_mut() else {
            return;
        };
        let ticks = pool.resolve();
        let period = pool.period_ns();

        for (position, name) in plan.names.clone().into_iter().enumerate() {
            let (Some(&start), Some(&end)) = (ticks.get(2 * position), ticks.get(2 * position + 1))
            else {
                continue;
            };
            let milliseconds = (end.saturating_sub(start)) as f64 * period / 1_000_000.0;
            self.record_pass_time(&name, milliseconds);
        }
    }

    /// The rendering-begin info for a graphics pass with attachment
    /// writes, or `None` for everything else.
    fn rendering_info(
        &self,
        pass_index: usize,
        backings: &[Option<Backing>],
    ) -> Option<vk::RenderingInfo> {
        let pass = &self.passes[pass_index];
        if pass.kind != PassKind::Graphics {
            return None;
        }

        let mut info = vk::RenderingInfo::default();
        for write in &pass.writes {
            let resource = &self.resources[write.0 as usize];
            let Some(Backing::Image(image)) = backings[write.0 as usize] else {
                continue;
            };
            match &resource.kind {
                ResourceKind::Swapchain { extent, .. } => {
                    info.extent = *extent;
                    info.color_attachments.push(vk::RenderingAttachment {
                        image,
                        layout: vk::ImageLayout::ColorAttachment,
                    });
                }
                ResourceKind::Image { extent, format, usage } => {
                    let depth = format.is_depth()
                        || usage.contains(vk::ImageUsage::DEPTH_STENCIL_ATTACHMENT);
                    if depth {
                        info.extent = *extent;
                        info.depth_attachment = Some(vk::RenderingAttachment {
                            image,
                            layout: vk::ImageLayout::DepthStencilAttachment,
                        });
                    } else if usage.contains(vk::ImageUsage::COLOR_ATTACHMENT) {
                        info.extent = *extent;
                        info.color_attachments.push(vk::RenderingAttachment {
                            image,
                            layout: vk::ImageLayout::ColorAttachment,
                        });
                    }
                }
                ResourceKind::Buffer { .. } => {}
            }
        }

        (!info.color_attachments.is_empty() || info.depth_attachment.is_some()).then_some(info)
    }
}

fn emit_barriers(
    barriers: &[Barrier],
    backings: &[Option<Backing>],
    cmd: &mut dyn vk::CommandBuffer,
) {
    if barriers.is_empty() {
        return;
    }

    let mut buffer_barriers = Vec::new();
    let mut image_barriers = Vec::new();
    for barrier in barriers {
        match backings[barrier.resource.0 as usize] {
            Some(Backing::Buffer(buffer)) => buffer_barriers.push(vk::BufferBarrier {
                buffer,
                src_stage: barrier.src_stage,
                src_access: barrier.src_access,
                dst_stage: barrier.dst_stage,
                dst_access: barrier.dst_access,
            }),
            Some(Backing::Image(image)) => image_barriers.push(vk::ImageBarrier {
                image,
                src_stage: barrier.src_stage,
                src_access: barrier.src_access,
                dst_stage: barrier.dst_stage,
                dst_access: barrier.dst_access,
                old_layout: barrier.old_layout,
                new_layout: barrier.new_layout,
            }),
            None => unreachable!("barrier against an unbacked resource"),
        }
    }
    cmd.pipeline_barrier(&buffer_barriers, &image_barriers);
}
