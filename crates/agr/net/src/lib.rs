//! AGR kernel-to-kernel synchronization.
//!
//! Each pair of connected kernels shares one [`ConnectionLink`] carrying a
//! handshake, one full organization snapshot per direction, then membership
//! deltas and forwarded messages. The [`NetworkCoordinator`] owns the links
//! of one kernel.

pub mod coordinator;
pub mod error;
pub mod frame;
pub mod link;

pub use coordinator::{LinkThreads, LocalDelivery, NetTimeouts, NetworkCoordinator, StdThreads};
pub use error::{NetError, NetResult};
pub use frame::{Control, DeltaKind, Frame, FrameReader, FrameWriter, MAX_FRAME_LEN};
pub use link::{CloseReason, ConnectionLink, LinkState};
