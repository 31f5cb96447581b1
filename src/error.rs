//! Error types for the fallible, non-tick operations of the crate.
//!
//! Broken hierarchy invariants found while a tick is running are not represented here: those are
//! bugs in an earlier tick or in calling code, and abort the frame with a panic.

use core::fmt;

use bevy_ecs::prelude::*;

/// Failure of an on-demand world matrix computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeWorldMatrixError {
    /// The entity, or one of its ancestors, does not exist or has no
    /// [`LocalTransform`](crate::components::LocalTransform).
    MissingLocalTransform {
        /// The entity that was missing the component.
        entity: Entity,
    },
    /// The ancestor chain is deeper than the configured maximum, which almost certainly means the
    /// [`Parent`](crate::components::Parent) graph contains a cycle.
    DepthExceeded {
        /// The entity the walk started from.
        entity: Entity,
        /// The configured maximum depth.
        max_depth: usize,
    },
}

impl fmt::Display for ComputeWorldMatrixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingLocalTransform { entity } => {
                write!(f, "entity {entity} in the ancestor chain has no LocalTransform")
            }
            Self::DepthExceeded { entity, max_depth } => write!(
                f,
                "ancestor chain of {entity} is deeper than {max_depth}; \
                the hierarchy probably contains a cycle"
            ),
        }
    }
}

impl std::error::Error for ComputeWorldMatrixError {}

/// A write group registration that would make the owner of a target component ambiguous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteGroupError {
    /// The producer was already registered for this target.
    DuplicateProducer {
        /// Type name of the target component.
        target: &'static str,
        /// Type name of the producer component.
        producer: &'static str,
    },
    /// The producer is one of the inputs the default computation of the target reads, so it cannot
    /// also claim the target for someone else.
    ReservedInput {
        /// Type name of the target component.
        target: &'static str,
        /// Type name of the producer component.
        producer: &'static str,
    },
}

impl fmt::Display for WriteGroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateProducer { target, producer } => {
                write!(f, "{producer} is already registered as a producer of {target}")
            }
            Self::ReservedInput { target, producer } => write!(
                f,
                "{producer} is a default input of {target} \
                and cannot claim it as an alternate producer"
            ),
        }
    }
}

impl std::error::Error for WriteGroupError {}
