//! Pulse Core
//!
//! Reactive notification primitives and a typed message bus.
//!
//! - `signal`: value-less and value-carrying observables, with async
//!   loading wrappers that expose progress and failure as observables too
//! - `bus`: type-keyed publish/subscribe with priorities, filters, retries,
//!   timeouts, weak targets, background delivery and a middleware pipeline
//! - `config`: bus settings, loadable from JSON
//! - `error`: the crate's error types
//!
//! # Example
//!
//! ```rust
//! use pulse_core::signal::TypedSignal;
//! use pulse_core::bus::SignalBus;
//!
//! let count = TypedSignal::new(0);
//! let _watch = count.subscribe_value(|n| println!("count is {n}"));
//! count.set(5);
//!
//! #[derive(Debug)]
//! struct Reset;
//!
//! let bus = SignalBus::new();
//! let count_for_bus = count.clone();
//! bus.subscribe(move |_: &Reset| {
//!     count_for_bus.set(0);
//!     Ok(())
//! });
//! bus.publish(Reset).unwrap();
//! assert_eq!(count.get(), 0);
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod signal;

pub use bus::{SignalBus, SignalBusSubscriptionOptions};
pub use config::SignalBusConfig;
pub use error::{BusError, HandlerError, HandlerResult, LoadError};
pub use signal::{
    AsyncSignal, AsyncTypedSignal, Observable, Signal, SubscriptionHandle, SubscriptionId,
    TypedSignal,
};
