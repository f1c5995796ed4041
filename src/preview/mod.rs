//! Sandbox preview resolution: host parsing, control plane lookups and the
//! bounded URL/token cache.

mod address;
mod cache;
mod control_plane;
mod resolver;

pub use address::{first_label, is_preview_host, strip_port, SandboxAddress};
pub use cache::{PreviewCache, PreviewCacheEntry};
pub use control_plane::{HttpControlPlane, PortPreview, SandboxControlPlane, SandboxInfo};
pub use resolver::{PreviewResolver, ResolvedPreview};
