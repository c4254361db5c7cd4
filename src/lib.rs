//! patscan — cyclic pattern tooling for locating buffer overflow offsets.
//!
//! Write a pattern into the target's input, let it crash, then ask where
//! the pattern ended up: in which registers, at which writable addresses,
//! and at what offset into the pattern each fragment sits.
//!
//! # Module overview
//!
//! ## Core
//!
//! - [`error`] — Error types used throughout the crate.
//! - [`types`] — `VirtAddr`, `AddressRange`, `Orientation`, `JobState`.
//! - [`pattern`] — Pattern generation and 4-byte offset lookup.
//! - [`procfs`] — `/proc/pid/maps` parsing down to writable ranges.
//! - [`scan`] — Register and memory-range search, cancellation, progress.
//! - [`findings`] — Address-ordered results and report rendering.
//! - [`config`] — Scan tunables.
//! - [`job`] — The single background search slot.
//! - [`session`] — `create` / `find` / `search` / `cancel` entry points.
//!
//! ## Live targets *(Linux-only)*
//!
//! - [`process`] — ptrace attach/detach and `/proc/pid/mem` reads.
//! - [`registers`] — x86_64 register capture.
//! - [`target`] — An attached process wired into a [`session::Session`].

// Platform-independent modules
pub mod error;
pub mod types;
pub mod pattern;
pub mod procfs;
pub mod findings;
pub mod config;
pub mod scan;
pub mod job;
pub mod session;

// Linux-only modules (ptrace, user_regs_struct)
#[cfg(target_os = "linux")]
pub mod process;
#[cfg(target_os = "linux")]
pub mod registers;
#[cfg(target_os = "linux")]
pub mod target;
