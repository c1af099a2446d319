//! TAO: a typed hierarchy of process-shared objects for real-time
//! adaptive-optics processes.
//!
//! - [`segment`] — component C, the System V shared-segment manager.
//! - [`object`] — component D, the shared-object base header and its
//!   lock/condition delegation.
//! - [`rwlocked`] — component E, an object with an attached r/w lock.
//! - [`array`] — component G, a shared multi-dimensional array.
//! - [`remote`] — components F/H, the remote-object client/server protocol
//!   and its camera/mirror/sensor subclasses.
//! - [`pixel`] — component I, the pixel copy/convert/preprocess engine.
//! - [`tools`] — component J, cross-array-kind region copy.
//!
//! Logging follows the ambient convention of the wider workspace: call
//! [`init_tracing`] once at process start, then use the `tracing` macros.

pub mod array;
pub mod object;
pub mod pixel;
pub mod remote;
pub mod rwlocked;
pub mod segment;
pub mod tools;

pub use tao_common::error::{Status, TaoError, TaoResult};

/// Install a global `tracing` subscriber reading `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
