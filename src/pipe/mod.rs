//! Byte-level transport to headless child processes.
//!
//! - `codec`: newline framing with a per-line size limit.
//! - `spawner`: launches the external tool with no controlling terminal.
//! - `channel`: [`PipeChannel`](channel::PipeChannel), line write and
//!   deadline-bounded line read over the child's standard streams.
//! - `signal`: terminate/kill delivery to a child's process group.

pub mod channel;
pub mod codec;
pub mod signal;
pub mod spawner;
