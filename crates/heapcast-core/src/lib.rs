//! # heapcast-core
//!
//! Foundation types, heap contract, wire protocol and errors for heapcast.
//!
//! This crate provides the shared vocabulary the engine and its collaborators agree on:
//!
//! - **Branded IDs**: [`ids::HeapUri`], [`ids::HeapId`], [`ids::SessionId`], [`ids::SubscriptionId`]
//! - **Heap contract**: [`heap::Heap`], [`heap::HeapListener`], [`heap::Update`], [`heap::UpdateAction`]
//! - **Reference heap**: [`heap::MemoryHeap`], an in-memory object tree implementing the contract
//! - **Subscriptions**: publisher-side [`subscription::Subscription`] handle and [`subscription::CloseReason`]
//! - **Wire protocol**: [`protocol::PushMessage`] and the per-version [`protocol::encode`] codec
//! - **Errors**: [`errors::HeapError`], [`errors::CodecError`] via `thiserror`
//! - **Logging**: [`logging::init_subscriber`] bootstrap for `tracing`
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by all other heapcast crates.

#![deny(unsafe_code)]

pub mod errors;
pub mod heap;
pub mod ids;
pub mod logging;
pub mod protocol;
pub mod subscription;
