//! Domain data types.

pub mod conflict;
pub mod engine;
pub mod outbox;
pub mod presence;
pub mod progress;
pub mod subscription;
pub mod wire;

pub use conflict::*;
pub use engine::*;
pub use outbox::*;
pub use presence::*;
pub use progress::*;
pub use subscription::*;
pub use wire::*;
