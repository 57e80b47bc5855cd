//! Resources that straddle the checkpoint boundary. The engine only sees the
//! container's side of them, so they are declared external on dump and
//! mapped back onto the host on restore.

pub mod mounts;
pub mod tty;

pub use mounts::BindMount;
pub use tty::{ConsoleMapping, TtyIdentity};
