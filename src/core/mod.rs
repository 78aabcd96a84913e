pub mod authority;
pub mod group;
pub mod reply;
pub mod server;

pub use authority::{AuthorityError, CertificateAuthority, TlsManager};
pub use group::{Middleware, RouteBinding, RouteGroup, RouteTree};
pub use reply::{Message, Reply};
pub use server::{Phase, Server};
