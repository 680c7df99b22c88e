//! Capability System
//!
//! Implements the object-capability model at the heart of the kernel.
//!
//! # Design
//! - Capabilities are a closed tagged union ([`capability::Capability`]);
//!   every privileged operation validates one before acting
//! - Slots pair a capability with derivation-list links and live in one
//!   global arena ([`slot`])
//! - CSpaces are guarded radix tries of CNodes resolved bit by bit
//!   ([`cspace`])
//! - The derivation list supports atomic insert/move/swap, recursive
//!   revoke, and incremental Zombie deletion ([`cdt`], [`finalise`])
//! - Untyped memory is the sole source of new objects ([`untyped`])
//!
//! # Security Properties
//! - Capabilities cannot be forged or guessed
//! - Rights can only be reduced along derivation, never increased
//! - Deletion never leaves a dangling derivation link

pub mod capability;
pub mod cdt;
pub mod cspace;
pub mod finalise;
pub mod slot;
pub mod untyped;

pub use capability::{CapRights, Capability, ZombieKind};
pub use slot::Slot;
pub use untyped::ObjectType;
