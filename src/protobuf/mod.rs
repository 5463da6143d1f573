//! Runtime-loaded protobuf schema registry.
//!
//! The upstream venue's message schema is versioned and shipped as `.proto`
//! files rather than fixed at this crate's compile time, so message shapes
//! are resolved reflectively through a [`prost_reflect::DescriptorPool`]
//! instead of codegen'd structs. This is the one place in the gateway where
//! dynamic dispatch on externally-loaded schema is appropriate.

mod codec;
mod registry;

pub use codec::DecodedEnvelope;
pub use registry::ProtoRegistry;
