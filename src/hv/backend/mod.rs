// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Concrete [`super::Hypervisor`] / [`super::RegionSource`] implementations.

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use macos::{HvfBackend, MachRegionSource};

#[cfg(test)]
mod mock;
#[cfg(test)]
pub use mock::{MockBackend, MockRegionSource};
