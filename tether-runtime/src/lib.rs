//! # Tether Runtime
//!
//! Handle bridge between native code and a managed, possibly relocating heap.
//!
//! Native code only understands flat integers and pointer arithmetic. The
//! bridge hands it stable 64-bit handle words instead of addresses:
//!
//! - **Opaque handles**: identity only; compare, resolve, release
//! - **Deref handles**: additionally support byte-offset loads and stores,
//!   translated into field accesses through a native [`LayoutDescriptor`]
//! - **Native exports**: C ABI entry points over an installed bridge
//!
//! ## Technical Standards
//!
//! - **Handles**: generational indices per
//!   [Handles are the better pointers](https://floooh.github.io/2018/06/17/handles-vs-pointers.html)
//! - **Layouts**: C struct layout rules (natural alignment, tail padding)
//! - **Locking**: a single [`parking_lot::RwLock`] over table and cache
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         TETHER RUNTIME                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Exports    │  │    Bridge    │  │  Deref View  │          │
//! │  │ (exports.rs) │──│ (bridge.rs)  │──│  (deref.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                      │         │            │                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │ Handle Table │  │   Identity   │  │    Layout    │          │
//! │  │  (table.rs)  │  │(identity.rs) │  │ (layout.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                                                        │
//! │  ┌──────────────┐  ┌──────────────────────────────────┐        │
//! │  │  Tag Scheme  │  │  ManagedRuntime (runtime.rs)     │        │
//! │  │   (tag.rs)   │  │  reference impl: heap.rs         │        │
//! │  └──────────────┘  └──────────────────────────────────┘        │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tether_runtime::heap::{ManagedHeap, Value};
//! use tether_runtime::layout::{FieldType, LayoutDescriptor};
//! use tether_runtime::{DerefAccess, HandleBridge};
//!
//! let heap = Arc::new(ManagedHeap::new());
//! let layout = heap.register_layout(
//!     LayoutDescriptor::builder("Point")
//!         .field("x", FieldType::i32())
//!         .field("y", FieldType::i32())
//!         .build()
//!         .unwrap(),
//! );
//! let point = heap.alloc("Point", [("x", Value::Int(7)), ("y", Value::Int(9))]);
//!
//! let bridge = HandleBridge::new(heap.clone());
//! let h = bridge.create_deref(&point, layout).unwrap();
//! assert_eq!(bridge.read_i32(h, 4).unwrap(), 9);
//!
//! bridge.write_i32(h, 0, 100).unwrap();
//! assert_eq!(point.get("x"), Some(Value::Int(100)));
//!
//! bridge.release(h).unwrap();
//! assert!(!bridge.is_handle(h));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bridge;
pub mod config;
pub mod deref;
pub mod error;
pub mod exports;
pub mod heap;
pub mod identity;
pub mod layout;
pub mod runtime;
pub mod table;
pub mod tag;

// Re-exports
pub use bridge::{BridgeStats, HandleBridge};
pub use config::{BridgeConfig, BridgeConfigBuilder, ConfigError, LogLevel};
pub use deref::DerefAccess;
pub use error::{HandleError, HandleResult};
pub use exports::{install_bridge, uninstall_bridge, NativeSurface};
pub use layout::{FieldDescriptor, FieldType, LayoutDescriptor, LayoutError};
pub use runtime::{FieldValue, ManagedRuntime, RuntimeError};
pub use table::TableStats;
pub use tag::{HandleKind, HandleWord};

use tracing_subscriber::EnvFilter;

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install a `tracing` subscriber that prints bridge events.
///
/// `RUST_LOG` overrides `level` when set. Returns `false` if a global
/// subscriber was already installed, which leaves that subscriber in place.
pub fn init_logging(level: LogLevel) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tether_runtime={}", level.as_str())));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}

/// Create a bridge configured from `TETHER_*` environment variables, with
/// logging initialized at the configured level.
pub fn bridge_from_env<R: ManagedRuntime>(
    runtime: std::sync::Arc<R>,
) -> Result<HandleBridge<R>, ConfigError> {
    let config = BridgeConfig::from_env();
    init_logging(config.log_level);
    HandleBridge::with_config(runtime, config)
}
