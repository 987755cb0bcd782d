//! # carte-image
//!
//! Image building and storage for the carte engine.
//!
//! Handles:
//! - **Manifests**: `Cartefile` parsing into typed build instructions.
//! - **Layers**: filesystem snapshots, diff archives, and whiteout-aware extraction.
//! - **Layer Store**: content-addressed cache of instruction-produced layers.
//! - **Packages**: self-describing image archives (`manifest.json`, `config.json`, layers).
//! - **Catalog**: the local index of built and imported images.
//! - **Sources**: `file://` and `tar://` base image import.
//! - **Builder**: the instruction loop tying all of the above together.
//! - **Hashing**: SHA-256 content addressing.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod builder;
pub mod hash;
pub mod ignore;
pub mod layer;
pub mod manifest;
pub mod package;
pub mod registry;
pub mod rootpath;
pub mod source;
pub mod storage;
