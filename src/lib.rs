//! nasrc Library
//!
//! Boot-time and build orchestration for a FreeBSD-based NAS. Every operation
//! reads the product configuration database, drives an external tool
//! (`warden`, `jexec`, `mdconfig`, `mount`, `make`) and interprets its output.
//! Long-running tools go through a timeout guard that serializes identical
//! command lines and kills commands that overrun.

pub mod cache;
pub mod config;
pub mod dirsrv;
pub mod escape;
pub mod exec;
pub mod jail;
pub mod logging;
pub mod mounttab;
pub mod pipeline;
pub mod store;
