// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! vane: a game engine core.
//!
//! The engine is built from four interlocking subsystems, each its own
//! crate, re-exported here under one roof:
//!
//! - [`tasklet`]: a fiber-based work-stealing cooperative scheduler with
//!   promises, futures, latches, a tasklet-aware mutex and an async I/O
//!   completion path.
//! - [`ecs`]: sparse-set entity/component storage with views and binary
//!   (de)serialization.
//! - [`vpak`]: the content archive format, block-compressed with Zstd and
//!   indexed by a minimal perfect hash.
//! - [`render_graph`]: a declarative DAG of passes over named resources,
//!   compiled per frame into an ordered plan with synchronization.
//!
//! The Vulkan backend proper is an external collaborator; [`vk`] carries
//! only the interface shape the render graph records against.
//!
//! A typical frame: tasklets load assets through the vpak reader (using
//! the scheduler's I/O path), systems run over the world, a render graph
//! is declared and compiled towards the swapchain image, and the compiled
//! plan is executed into a command buffer.

pub mod render_graph;
pub mod vk;

pub use vane_ecs as ecs;
pub use vane_fiber as fiber;
pub use vane_queue as queue;
pub use vane_stream as stream;
pub use vane_tasklet as tasklet;
pub use vane_vpak as vpak;
