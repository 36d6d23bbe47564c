// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! A thin user-mode hypervisor that runs untrusted native code as an
//! in-process "virtual thread" (vthread): a guest vCPU launched with a
//! 64-bit identity-mapped view of the launching process's address space, so
//! guest code can call directly into host code and touch host data with no
//! marshalling layer.
//!
//! The crate is organized around three tightly coupled subsystems:
//!
//! - [`page_tables`] / [`address_space`] — the identity address-space
//!   builder.
//! - [`msr`] / [`msr_index`] — the MSR-emulation table.
//! - [`vcpu_bootstrap`] / [`exit_loop`] / [`vcpu_state`] — the vthread
//!   lifecycle.
//!
//! [`facade`] is the public surface ([`vth_init`], [`vthread_create`],
//! [`vthread_join`]) that ties them together. [`hv`] is the abstract
//! hardware-virtualization capability surface this crate treats as an
//! external collaborator, backed on `target_os = "macos"` by Apple's
//! `Hypervisor.framework` through the `hv`/`mach2` crates.
//!
//! This crate targets `x86_64-apple-darwin` exclusively, the same substrate
//! the distilled original (`xhype`) ran on — there is no software-emulation
//! or other-hypervisor fallback.

#![cfg(target_os = "macos")]

use thiserror::Error;

pub mod address_space;
pub mod exit_loop;
mod facade;
pub mod hv;
pub mod msr;
pub mod msr_index;
pub mod page_tables;
pub mod vcpu_bootstrap;
pub mod vcpu_state;

pub use facade::{vth_init, vthread_create, vthread_join, ExitStatus, Vthread};

/// Crate-wide error type, aggregating every subsystem's own `Error` into one
/// taxonomy: hypervisor-call failures, unhandled exits, MSR violations, and
/// resource exhaustion.
#[derive(Debug, Error)]
pub enum Error {
    #[error("address space construction failed: {0}")]
    AddressSpace(#[from] address_space::Error),
    #[error("vcpu bootstrap failed: {0}")]
    Bootstrap(#[from] vcpu_bootstrap::Error),
    #[error(transparent)]
    ExitLoop(#[from] exit_loop::Error),
    #[error("hypervisor call failed: {0}")]
    Hypervisor(#[from] hv::HvError),
    #[error("vth_init was already called in this process")]
    AlreadyInitialized,
    #[error("vth_init has not been called in this process yet")]
    NotInitialized,
    #[error("stack arena exhausted: all {0} slots are in use; join a vthread before creating another")]
    StackArenaExhausted(usize),
    #[error("a vthread's host thread panicked instead of returning")]
    ThreadPanicked,
}

pub type Result<T> = std::result::Result<T, Error>;
