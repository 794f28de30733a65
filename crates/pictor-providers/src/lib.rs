//! Pictor Image Providers
//!
//! Two interchangeable capabilities behind [`ImageProvider`]:
//!
//! - [`LocalDiffusionProvider`]: GPU-resident model, admitted through the
//!   resource manager; surfaces `OutOfMemory` when the device refuses an
//!   allocation mid-run
//! - [`RemoteApiProvider`]: vendor image API with its own bounded
//!   network retry and job polling
//!
//! Both return a [`ProviderOutput`] (image + [`ProviderMetadata`]) or a
//! [`ProviderFailure`] tagged with a [`FailureKind`].

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod local;
mod provider;
mod remote;

pub use local::{
    classify_worker_error, DiffusionBackend, DiffusionJob, HttpDiffusionBackend,
    LocalDiffusionProvider, LocalProviderConfig,
};
pub use provider::{
    FailureKind, ImageProvider, ProviderFailure, ProviderLease, ProviderMetadata, ProviderOutput,
};
pub use remote::{vendor_prompt, RemoteApiProvider, RemoteProviderConfig};
